// Session manager: admission control, termination and activity accounting

use super::quota::QuotaTracker;
use super::registry::SessionRegistry;
use super::types::{
    ManagerSettings, Session, SessionError, SessionIdGenerator, SessionLimits,
    SessionLimitsUpdate, StopReason, UserStats,
};
use crate::clock::{Clock, SystemClock, local_midnight};
use crate::health::{HealthCheck, HealthReport, StoreHealthCheck, resident_memory_mb};
use crate::metrics;
use crate::sink::{ActivityRecord, BatchSink, SinkError};
use crate::storage::{DocumentFilter, DocumentStore, SESSIONS_COLLECTION, StorageError};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Stopped sessions kept in memory while their final document is unwritten
const MAX_UNMIRRORED: usize = 1024;

/// Mutable state owned by the manager.
///
/// Lock order is `state`, then a session's write lock. Nothing holding a
/// write lock takes `state`. Sink flushes and store writes for terminations
/// run with `state` released; only preemption inside `start` keeps it.
struct ManagerState {
    registry: SessionRegistry,
    quota: QuotaTracker,
    limits: SessionLimits,
    /// Activity calls per session, drives the mirror throttle
    activity_calls: HashMap<String, u64>,
    /// Serializes store writes per session so the stopped document lands last
    write_locks: HashMap<String, Arc<Mutex<()>>>,
    /// Stopped sessions whose final mirror write failed, retried by the sweep
    unmirrored: HashMap<String, Session>,
}

/// Counts published for health checks
#[derive(Debug, Clone, Copy, Default)]
struct Occupancy {
    active_sessions: usize,
    distinct_users: usize,
    max_concurrent_sessions: usize,
}

/// Session manager for handling session lifecycle and operations
pub struct SessionManager {
    state: Mutex<ManagerState>,
    occupancy: SyncMutex<Occupancy>,
    timers: SyncMutex<HashMap<String, JoinHandle<()>>>,
    store: Arc<dyn DocumentStore>,
    sink: Arc<dyn BatchSink>,
    clock: Arc<dyn Clock>,
    ids: SessionIdGenerator,
    settings: ManagerSettings,
    self_ref: Weak<SessionManager>,
}

/// A session claimed for termination, with its write lock held
struct Claimed {
    session: Session,
    write: OwnedMutexGuard<()>,
}

impl SessionManager {
    /// Create a new session manager on the system clock
    pub fn new(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn BatchSink>,
        limits: SessionLimits,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        Self::with_clock(store, sink, limits, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn DocumentStore>,
        sink: Arc<dyn BatchSink>,
        limits: SessionLimits,
        settings: ManagerSettings,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let today = clock.today();
        let occupancy = Occupancy {
            max_concurrent_sessions: limits.max_concurrent_sessions,
            ..Default::default()
        };
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(ManagerState {
                registry: SessionRegistry::new(),
                quota: QuotaTracker::new(today),
                limits,
                activity_calls: HashMap::new(),
                write_locks: HashMap::new(),
                unmirrored: HashMap::new(),
            }),
            occupancy: SyncMutex::new(occupancy),
            timers: SyncMutex::new(HashMap::new()),
            store,
            sink,
            clock,
            ids: SessionIdGenerator::new(),
            settings,
            self_ref: self_ref.clone(),
        })
    }

    /// Start a session for a user.
    ///
    /// Rejections leave the registry and the daily counter untouched. Any
    /// session the user already holds is stopped first.
    pub async fn start(&self, user_id: &str) -> Result<String, SessionError> {
        if user_id.trim().is_empty() {
            metrics::record_admission_rejected("invalid_user");
            return Err(SessionError::InvalidUser);
        }

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = self.clock.now();
        let today = self.clock.today();
        let limits = state.limits.clone();

        if !state.quota.can_start_daily(user_id, today, &limits) {
            warn!(
                user_id,
                limit = limits.max_daily_sessions_per_user,
                "Daily session quota exhausted"
            );
            metrics::record_admission_rejected("quota_exceeded");
            return Err(SessionError::QuotaExceeded {
                user_id: user_id.to_string(),
                limit: limits.max_daily_sessions_per_user,
            });
        }

        if !state
            .quota
            .can_start_concurrent(state.registry.len(), &limits)
        {
            warn!(
                user_id,
                active = state.registry.len(),
                limit = limits.max_concurrent_sessions,
                "Concurrent session capacity exhausted"
            );
            metrics::record_admission_rejected("capacity_exceeded");
            return Err(SessionError::CapacityExceeded {
                limit: limits.max_concurrent_sessions,
            });
        }

        if let Some(previous) = state.registry.active_for_user(user_id).map(str::to_string) {
            info!(
                "Preempting session {} for user {} before starting a new one",
                previous, user_id
            );
            if let Some(claimed) = self.claim(state, &previous).await {
                let (session, mirrored) = self.close(claimed, StopReason::Preempted).await;
                self.complete(state, session, StopReason::Preempted, mirrored);
            }
        }

        let session_id = self.ids.next_id(user_id, now);
        let session = Session::new(
            session_id.clone(),
            user_id.to_string(),
            now,
            &limits,
            self.settings.resource_width,
        );
        let deadline = session.deadline;
        let snapshot = session.clone();
        state.registry.insert(session);
        state
            .write_locks
            .insert(session_id.clone(), Arc::new(Mutex::new(())));

        // A failed mirror write leaves the session running memory-only
        if !self.mirror(&snapshot, "start").await {
            warn!(
                session_id = %session_id,
                "Session started without a durable mirror copy"
            );
        }

        self.arm_expiry_timer(&session_id, deadline);
        state.quota.record_daily_start(user_id, today);

        metrics::record_session_started();
        metrics::record_active_sessions(state.registry.len());
        self.publish(state);

        info!(
            "Started session {} for user {} (deadline {}, {} active)",
            session_id,
            user_id,
            deadline,
            state.registry.len()
        );

        Ok(session_id)
    }

    /// Stop a session. Unknown or already stopped sessions are a logged no-op.
    pub async fn stop(&self, session_id: &str) {
        if !self.stop_with_reason(session_id, StopReason::Requested).await {
            warn!(
                session_id,
                "Stop requested for unknown or already stopped session"
            );
        }
    }

    /// Stop a session for the given reason. Returns false if it was not active
    /// or another termination already claimed it.
    pub(crate) async fn stop_with_reason(&self, session_id: &str, reason: StopReason) -> bool {
        let claimed = {
            let mut state = self.state.lock().await;
            self.claim(&mut state, session_id).await
        };

        match claimed {
            Some(claimed) => {
                self.finish(claimed, reason).await;
                true
            }
            None => {
                debug!(
                    "Session {} already gone when {} stop ran",
                    session_id, reason
                );
                false
            }
        }
    }

    /// Record activity units against an active session.
    ///
    /// Each call is appended to the batch sink. Stops the session before
    /// returning once its activity cap is reached.
    pub async fn record_activity(&self, session_id: &str, count: u64) {
        if count == 0 {
            return;
        }

        enum Next {
            Done,
            Mirror(Session, OwnedMutexGuard<()>),
            Stop(Claimed),
        }

        let next = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let now = self.clock.now();

            let Some(session) = state.registry.active_mut(session_id) else {
                debug!("Ignoring activity for inactive session {}", session_id);
                return;
            };

            session.record_activity(count, now);
            metrics::record_activity(count);
            let record = ActivityRecord {
                session_id: session_id.to_string(),
                recorded_at: now,
                payload: json!({ "count": count, "total": session.activity_count }),
            };
            let limit_reached = session.activity_limit_reached();
            let snapshot = session.clone();

            // Appends buffer locally, and must land before any flush claims the session
            if let Err(e) = self.sink.append(record).await {
                warn!(session_id, error = %e, "Activity record not buffered");
            }

            if limit_reached {
                info!(
                    "Session {} reached its activity limit ({}/{})",
                    session_id, snapshot.activity_count, snapshot.limits.max_activity_per_session
                );
                match self.claim(state, session_id).await {
                    Some(claimed) => Next::Stop(claimed),
                    None => Next::Done,
                }
            } else {
                let calls = state
                    .activity_calls
                    .entry(session_id.to_string())
                    .or_insert(0);
                *calls += 1;
                if *calls % self.settings.mirror_every_n_activity.max(1) != 0 {
                    Next::Done
                } else {
                    let write = state
                        .write_locks
                        .get(session_id)
                        .and_then(|lock| lock.clone().try_lock_owned().ok());
                    match write {
                        Some(write) => Next::Mirror(snapshot, write),
                        None => {
                            // The write already in flight covers this one
                            debug!("Mirror write for session {} already in flight", session_id);
                            Next::Done
                        }
                    }
                }
            }
        };

        match next {
            Next::Done => {}
            Next::Mirror(snapshot, _write) => {
                debug!(
                    "Mirroring session {} at {} activity",
                    session_id, snapshot.activity_count
                );
                self.mirror(&snapshot, "activity").await;
            }
            Next::Stop(claimed) => self.finish(claimed, StopReason::ActivityLimit).await,
        }
    }

    /// Snapshot of all active sessions, in no particular order
    pub async fn list_active(&self) -> Vec<Session> {
        let state = self.state.lock().await;
        state.registry.snapshot()
    }

    /// Look a session up, falling back to the durable mirror for stopped ones.
    ///
    /// Stopped sessions whose final write has not reached the store yet are
    /// served from memory.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        {
            let state = self.state.lock().await;
            if let Some(session) = state.registry.get(session_id) {
                return Some(session.clone());
            }
            if let Some(session) = state.unmirrored.get(session_id) {
                return Some(session.clone());
            }
        }

        match self
            .with_store_timeout(self.store.get(SESSIONS_COLLECTION, session_id))
            .await
        {
            Ok(Some(doc)) => match Session::from_document(doc) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!("Stored session {} is unreadable: {}", session_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(session_id, error = %e, "Session lookup in store failed");
                None
            }
        }
    }

    /// Usage summary for a user
    pub async fn get_user_stats(&self, user_id: &str) -> UserStats {
        let today = self.clock.today();
        let since = local_midnight(today)
            .unwrap_or_else(|| self.clock.now() - chrono::Duration::hours(24));

        let (active_count, daily_count, live) = {
            let state = self.state.lock().await;
            let live: Vec<(String, u64, DateTime<Utc>)> = state
                .registry
                .active_for_user(user_id)
                .and_then(|id| state.registry.get(id))
                .map(|s| (s.session_id.clone(), s.activity_count, s.started_at))
                .into_iter()
                .collect();
            (
                live.len(),
                state.quota.daily_count(user_id, today),
                live,
            )
        };

        let filter = DocumentFilter::new()
            .field_eq("user_id", user_id)
            .field_gte("started_at", since.to_rfc3339());

        let mut per_session: HashMap<String, u64> = HashMap::new();
        match self
            .with_store_timeout(self.store.query(SESSIONS_COLLECTION, &filter))
            .await
        {
            Ok(docs) => {
                for doc in docs {
                    let Some(id) = doc.get("session_id").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let count = doc
                        .get("activity_count")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    per_session.insert(id.to_string(), count);
                }
            }
            Err(e) => {
                warn!(
                    user_id,
                    error = %e,
                    "Activity history unavailable, reporting in-memory totals only"
                );
            }
        }

        // The mirror lags for active sessions; memory is authoritative there
        for (id, count, started_at) in live {
            if started_at >= since {
                per_session.insert(id, count);
            }
        }

        UserStats {
            active_count,
            daily_count,
            total_activity_today: per_session.values().sum(),
        }
    }

    /// Point-in-time health snapshot.
    ///
    /// Reads published counts, so the only wait is the bounded store round trip.
    pub async fn health_check(&self) -> HealthReport {
        let occupancy = *self.occupancy.lock();

        let store_check = StoreHealthCheck::new(
            self.store.clone(),
            Duration::from_millis(self.settings.health_probe_timeout_ms),
        )
        .check()
        .await;

        let status = HealthReport::status_for(
            occupancy.active_sessions,
            occupancy.max_concurrent_sessions,
            store_check.passed,
        );
        if let Some(message) = &store_check.message {
            warn!("Health check degraded: {}", message);
        }

        HealthReport {
            status,
            active_sessions: occupancy.active_sessions,
            distinct_users: occupancy.distinct_users,
            memory_mb: resident_memory_mb(),
            store_reachable: store_check.passed,
            checked_at: self.clock.now(),
            probe_duration_ms: store_check.duration_ms,
        }
    }

    /// Replace limits for sessions created from now on
    pub async fn update_limits(&self, update: SessionLimitsUpdate) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let limits = state.limits.merged(&update);
        limits.validate()?;

        info!("Session limits updated: {:?}", limits);
        state.limits = limits;
        self.publish(&state);
        Ok(())
    }

    /// Current limits
    pub async fn limits(&self) -> SessionLimits {
        self.state.lock().await.limits.clone()
    }

    /// Stop every session past its deadline and retry unwritten stop
    /// documents. Returns how many sessions were stopped.
    pub async fn sweep_expired(&self) -> usize {
        let (claimed, unmirrored) = {
            let mut guard = self.state.lock().await;
            let now = self.clock.now();
            let mut claimed = Vec::new();
            for session_id in guard.registry.expired_ids(now) {
                if let Some(c) = self.claim(&mut guard, &session_id).await {
                    claimed.push(c);
                }
            }
            let unmirrored: Vec<Session> = guard.unmirrored.values().cloned().collect();
            (claimed, unmirrored)
        };

        let stopped = claimed.len();
        for c in claimed {
            self.finish(c, StopReason::Swept).await;
        }

        if stopped > 0 {
            info!("Sweep stopped {} expired sessions", stopped);
        }

        for session in unmirrored {
            if self.mirror(&session, "stop_retry").await {
                self.state.lock().await.unmirrored.remove(&session.session_id);
                debug!("Stop document for session {} written on retry", session.session_id);
            }
        }

        stopped
    }

    /// Clear all daily counters
    pub async fn reset_daily(&self) {
        self.reset_daily_on(self.clock.today()).await;
    }

    /// Clear all daily counters and start counting for `today`
    pub async fn reset_daily_on(&self, today: NaiveDate) {
        let mut state = self.state.lock().await;
        state.quota.reset_daily(today);
    }

    /// Close sessions a previous process left marked active in the store.
    ///
    /// They are flushed and written back as stopped; never re-admitted.
    pub async fn recover_orphans(&self) -> usize {
        let filter = DocumentFilter::new().field_eq("status", "active");
        let docs = match self
            .with_store_timeout(self.store.query(SESSIONS_COLLECTION, &filter))
            .await
        {
            Ok(docs) => docs,
            Err(e) => {
                warn!(error = %e, "Could not scan store for orphaned sessions");
                return 0;
            }
        };

        let orphans: Vec<Session> = {
            let state = self.state.lock().await;
            docs.into_iter()
                .filter_map(|doc| match Session::from_document(doc) {
                    Ok(session) => Some(session),
                    Err(e) => {
                        warn!("Skipping unreadable session document: {}", e);
                        None
                    }
                })
                .filter(|s| !state.registry.contains(&s.session_id))
                .collect()
        };

        let mut recovered = 0;
        for mut session in orphans {
            session.flush_error = self.flush(&session.session_id).await.err();
            session.stop(StopReason::Recovered, self.clock.now());
            self.mirror(&session, "recover").await;
            metrics::record_session_stopped(StopReason::Recovered.as_str());
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} orphaned sessions from the store", recovered);
        }
        recovered
    }

    /// Stop every active session and cancel pending timers
    pub async fn shutdown(&self) {
        let claimed = {
            let mut guard = self.state.lock().await;
            let mut claimed = Vec::new();
            for session_id in guard.registry.ids() {
                if let Some(c) = self.claim(&mut guard, &session_id).await {
                    claimed.push(c);
                }
            }
            claimed
        };

        let count = claimed.len();
        for c in claimed {
            self.finish(c, StopReason::Shutdown).await;
        }

        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }

        info!("Session manager shut down, stopped {} sessions", count);
    }

    /// Claim a session for termination: exactly one caller wins, which makes
    /// the flush happen at most once per session. Cancels its timer and
    /// takes its write lock, waiting out an in-flight activity write.
    async fn claim(&self, state: &mut ManagerState, session_id: &str) -> Option<Claimed> {
        let session = state.registry.begin_termination(session_id)?;

        if let Some(handle) = self.timers.lock().remove(session_id) {
            handle.abort();
        }
        self.publish(state);

        let lock = state
            .write_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let write = lock.lock_owned().await;

        Some(Claimed { session, write })
    }

    /// Flush and write the final document for a claimed session. Runs
    /// without the state lock except during preemption.
    async fn close(&self, claimed: Claimed, reason: StopReason) -> (Session, bool) {
        let Claimed { mut session, write } = claimed;

        session.flush_error = self.flush(&session.session_id).await.err();
        session.stop(reason, self.clock.now());
        let mirrored = self.mirror(&session, "stop").await;
        drop(write);

        (session, mirrored)
    }

    /// Remove a closed session from the registry
    fn complete(
        &self,
        state: &mut ManagerState,
        session: Session,
        reason: StopReason,
        mirrored: bool,
    ) {
        let session_id = session.session_id.clone();
        state.registry.remove(&session_id);
        state.activity_calls.remove(&session_id);
        state.write_locks.remove(&session_id);

        if !mirrored {
            if state.unmirrored.len() < MAX_UNMIRRORED {
                state.unmirrored.insert(session_id.clone(), session.clone());
            } else {
                warn!(
                    session_id = %session_id,
                    "Too many unwritten stop documents, the store keeps this session as active"
                );
            }
        }

        metrics::record_session_stopped(reason.as_str());
        metrics::record_active_sessions(state.registry.len());
        self.publish(state);

        info!(
            "Stopped session {} for user {} ({}, {} activity, {} active)",
            session_id,
            session.user_id,
            reason,
            session.activity_count,
            state.registry.len()
        );
    }

    /// Close a claimed session and remove it, re-taking the state lock
    async fn finish(&self, claimed: Claimed, reason: StopReason) {
        let (session, mirrored) = self.close(claimed, reason).await;
        let mut state = self.state.lock().await;
        self.complete(&mut state, session, reason, mirrored);
    }

    fn publish(&self, state: &ManagerState) {
        *self.occupancy.lock() = Occupancy {
            active_sessions: state.registry.len(),
            distinct_users: state.registry.distinct_users(),
            max_concurrent_sessions: state.limits.max_concurrent_sessions,
        };
    }

    /// Best-effort flush. Failures are logged and counted, never propagated.
    async fn flush(&self, session_id: &str) -> Result<(), String> {
        let limit_ms = self.settings.flush_timeout_ms;
        let result = match timeout(Duration::from_millis(limit_ms), self.sink.flush(session_id)).await
        {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(limit_ms)),
        };

        result.map_err(|e| {
            error!(
                session_id,
                kind = e.kind(),
                error = %e,
                "Batch sink flush failed, session data may be incomplete"
            );
            metrics::record_flush_failure(e.kind());
            e.to_string()
        })
    }

    /// Write the session document. Returns false (logged and counted) on failure.
    async fn mirror(&self, session: &Session, op: &'static str) -> bool {
        let doc = match session.to_document() {
            Ok(doc) => doc,
            Err(e) => {
                error!(session_id = %session.session_id, op, error = %e, "Session serialization failed");
                metrics::record_mirror_failure(op);
                return false;
            }
        };

        match self
            .with_store_timeout(self.store.put(SESSIONS_COLLECTION, &session.session_id, doc))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    session_id = %session.session_id,
                    op,
                    error = %e,
                    "Session mirror write failed"
                );
                metrics::record_mirror_failure(op);
                false
            }
        }
    }

    async fn with_store_timeout<T>(
        &self,
        op: impl std::future::Future<Output = Result<T, StorageError>>,
    ) -> Result<T, StorageError> {
        let limit_ms = self.settings.store_timeout_ms;
        match timeout(Duration::from_millis(limit_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::ConnectionError(format!(
                "store call timed out after {}ms",
                limit_ms
            ))),
        }
    }

    /// Arm the one-shot deadline timer for a session
    fn arm_expiry_timer(&self, session_id: &str, deadline: DateTime<Utc>) {
        let delay = (deadline - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let manager = self.self_ref.clone();
        let id = session_id.to_string();

        // The handle is inserted before the task can look itself up, so a
        // firing timer always removes its own entry before stopping and is
        // never aborted mid-termination.
        let mut timers = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = manager.upgrade() else {
                return;
            };
            manager.timers.lock().remove(&id);
            manager.stop_with_reason(&id, StopReason::Expired).await;
        });
        if let Some(previous) = timers.insert(session_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Number of armed expiry timers
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }
}
