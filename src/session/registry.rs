// Authoritative in-memory set of active sessions

use super::types::Session;
use std::collections::{HashMap, HashSet};

/// `session_id -> Session` with a per-user index.
///
/// Only active sessions live here; its size is the live concurrency level.
/// A session being terminated stays in the map (and keeps its slot) until
/// its flush completes, but drops out of the user index and of every
/// active view.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    by_user: HashMap<String, String>,
    terminating: HashSet<String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub fn is_terminating(&self, session_id: &str) -> bool {
        self.terminating.contains(session_id)
    }

    /// Mutable access to a session that is not being terminated
    pub fn active_mut(&mut self, session_id: &str) -> Option<&mut Session> {
        if self.terminating.contains(session_id) {
            return None;
        }
        self.sessions.get_mut(session_id)
    }

    /// Claim a session for termination. Returns its snapshot, or `None` if it
    /// is unknown or already claimed.
    pub fn begin_termination(&mut self, session_id: &str) -> Option<Session> {
        if self.terminating.contains(session_id) {
            return None;
        }
        let session = self.sessions.get(session_id)?.clone();
        self.terminating.insert(session_id.to_string());
        if self.by_user.get(&session.user_id).map(String::as_str) == Some(session_id) {
            self.by_user.remove(&session.user_id);
        }
        Some(session)
    }

    /// ID of the user's active session, if any
    pub fn active_for_user(&self, user_id: &str) -> Option<&str> {
        self.by_user.get(user_id).map(String::as_str)
    }

    /// Insert a session. A previous entry for the same user must already be
    /// removed; the user index always points at the newest session.
    pub fn insert(&mut self, session: Session) {
        self.by_user
            .insert(session.user_id.clone(), session.session_id.clone());
        self.sessions.insert(session.session_id.clone(), session);
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let session = self.sessions.remove(session_id)?;
        self.terminating.remove(session_id);
        if self.by_user.get(&session.user_id).map(String::as_str) == Some(session_id) {
            self.by_user.remove(&session.user_id);
        }
        Some(session)
    }

    pub fn distinct_users(&self) -> usize {
        self.by_user.len()
    }

    fn active(&self) -> impl Iterator<Item = &Session> {
        self.sessions
            .values()
            .filter(|s| !self.terminating.contains(&s.session_id))
    }

    pub fn snapshot(&self) -> Vec<Session> {
        self.active().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.active().map(|s| s.session_id.clone()).collect()
    }

    /// IDs of sessions whose deadline has passed
    pub fn expired_ids(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<String> {
        self.active()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect()
    }
}
