// Session types and data structures

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Process-wide admission and expiry limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionLimits {
    /// Sessions a single user may start per local calendar day
    pub max_daily_sessions_per_user: u32,
    /// Sessions allowed in the registry at once, across all users
    pub max_concurrent_sessions: usize,
    /// Absolute session lifetime
    pub max_session_duration_ms: u64,
    /// Activity units after which the session is stopped
    pub max_activity_per_session: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_daily_sessions_per_user: 10,
            max_concurrent_sessions: 5,
            max_session_duration_ms: 20 * 60 * 1000, // 20 minutes
            max_activity_per_session: 1000,
        }
    }
}

impl SessionLimits {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_daily_sessions_per_user == 0 {
            return Err(SessionError::InvalidLimits(
                "max_daily_sessions_per_user must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_sessions == 0 {
            return Err(SessionError::InvalidLimits(
                "max_concurrent_sessions must be greater than zero".to_string(),
            ));
        }
        if self.max_session_duration_ms == 0 {
            return Err(SessionError::InvalidLimits(
                "max_session_duration_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_activity_per_session == 0 {
            return Err(SessionError::InvalidLimits(
                "max_activity_per_session must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy with the fields present in `update` replaced
    pub fn merged(&self, update: &SessionLimitsUpdate) -> Self {
        Self {
            max_daily_sessions_per_user: update
                .max_daily_sessions_per_user
                .unwrap_or(self.max_daily_sessions_per_user),
            max_concurrent_sessions: update
                .max_concurrent_sessions
                .unwrap_or(self.max_concurrent_sessions),
            max_session_duration_ms: update
                .max_session_duration_ms
                .unwrap_or(self.max_session_duration_ms),
            max_activity_per_session: update
                .max_activity_per_session
                .unwrap_or(self.max_activity_per_session),
        }
    }

    pub fn session_duration(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.max_session_duration_ms).unwrap_or(i64::MAX))
    }
}

/// Tunables of the session manager itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ManagerSettings {
    /// Mirror a session to the store on every n-th activity call
    pub mirror_every_n_activity: u64,
    /// Upper bound on a single batch sink flush
    pub flush_timeout_ms: u64,
    /// Upper bound on mirror writes and store queries
    pub store_timeout_ms: u64,
    /// Upper bound on the health check store probe
    pub health_probe_timeout_ms: u64,
    /// Workload streams assigned to each new session
    pub resource_width: u32,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            mirror_every_n_activity: 10,
            flush_timeout_ms: 10_000,
            store_timeout_ms: 5_000,
            health_probe_timeout_ms: 5_000,
            resource_width: 10,
        }
    }
}

/// Partial limits update; `None` fields keep their current value
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionLimitsUpdate {
    pub max_daily_sessions_per_user: Option<u32>,
    pub max_concurrent_sessions: Option<usize>,
    pub max_session_duration_ms: Option<u64>,
    pub max_activity_per_session: Option<u64>,
}

/// Session status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Stopped,
}

/// Why a session was stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Explicit caller request
    Requested,
    /// One-shot deadline timer fired
    Expired,
    /// Activity cap reached
    ActivityLimit,
    /// Found past its deadline by the periodic sweep
    Swept,
    /// Replaced by a newer session of the same user
    Preempted,
    /// Manager shutting down
    Shutdown,
    /// Left active by a previous process and closed on startup
    Recovered,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Requested => "requested",
            StopReason::Expired => "expired",
            StopReason::ActivityLimit => "activity_limit",
            StopReason::Swept => "swept",
            StopReason::Preempted => "preempted",
            StopReason::Shutdown => "shutdown",
            StopReason::Recovered => "recovered",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-boxed, quota-counted lease on the metric workload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Unique session identifier
    pub session_id: String,
    /// Owning user
    pub user_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    /// `started_at + max_session_duration`, fixed at creation
    pub deadline: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub activity_count: u64,
    /// Number of workload streams this session drives
    pub resource_width: u32,
    /// Limits in force when the session was created
    pub limits: SessionLimits,
    pub ended_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<StopReason>,
    /// Set when the termination flush failed; the sink may hold partial data
    #[serde(default)]
    pub flush_error: Option<String>,
}

impl Session {
    /// Create a new active session
    pub fn new(
        session_id: String,
        user_id: String,
        now: DateTime<Utc>,
        limits: &SessionLimits,
        resource_width: u32,
    ) -> Self {
        Self {
            session_id,
            user_id,
            status: SessionStatus::Active,
            started_at: now,
            deadline: now
                .checked_add_signed(limits.session_duration())
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_activity_at: now,
            activity_count: 0,
            resource_width,
            limits: limits.clone(),
            ended_at: None,
            stop_reason: None,
            flush_error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Deadline reached or passed
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    pub fn activity_limit_reached(&self) -> bool {
        self.activity_count >= self.limits.max_activity_per_session
    }

    /// Add activity units and bump the last-activity timestamp
    pub fn record_activity(&mut self, count: u64, now: DateTime<Utc>) {
        self.activity_count = self.activity_count.saturating_add(count);
        if now > self.last_activity_at {
            self.last_activity_at = now;
        }
    }

    /// Transition to stopped; a no-op if already stopped
    pub fn stop(&mut self, reason: StopReason, now: DateTime<Utc>) {
        if self.status == SessionStatus::Stopped {
            return;
        }
        self.status = SessionStatus::Stopped;
        self.ended_at = Some(now);
        self.stop_reason = Some(reason);
    }

    pub fn to_document(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_document(doc: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(doc)
    }
}

/// Per-user usage summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStats {
    /// Sessions currently active for the user (0 or 1)
    pub active_count: usize,
    /// Sessions started today
    pub daily_count: u32,
    /// Activity units across today's sessions
    pub total_activity_today: u64,
}

/// Errors crossing the session manager facade
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Daily session limit of {limit} reached for user {user_id}")]
    QuotaExceeded { user_id: String, limit: u32 },
    #[error("Concurrent session capacity of {limit} reached")]
    CapacityExceeded { limit: usize },
    #[error("User ID must not be empty")]
    InvalidUser,
    #[error("Invalid session limits: {0}")]
    InvalidLimits(String),
}

impl SessionError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::QuotaExceeded { .. } => "quota_exceeded",
            SessionError::CapacityExceeded { .. } => "capacity_exceeded",
            SessionError::InvalidUser => "invalid_user",
            SessionError::InvalidLimits(_) => "invalid_limits",
        }
    }
}

/// Generates `{user_id}-{millis}-{suffix}` identifiers.
///
/// The millisecond component is strictly increasing per generator even when
/// the wall clock stalls or steps backwards.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last_millis: AtomicI64,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self, user_id: &str, now: DateTime<Utc>) -> String {
        let millis = now.timestamp_millis();
        let previous = self
            .last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(millis.max(last + 1))
            })
            .unwrap_or(millis);
        let stamp = millis.max(previous + 1);

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();

        format!("{}-{}-{}", user_id, stamp, suffix)
    }
}
