use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use parking_lot::Mutex;
use pmp_session_gate::clock::ManualClock;
use pmp_session_gate::health::HealthStatus;
use pmp_session_gate::metrics;
use pmp_session_gate::session::{
    LifecycleScheduler, ManagerSettings, SchedulerSettings, SessionError, SessionLimits,
    SessionManager, SessionStatus, StopReason,
};
use pmp_session_gate::sink::{BatchSink, MemoryBatchSink, SinkError};
use pmp_session_gate::storage::{
    DocumentFilter, DocumentStore, MemoryDocumentStore, SESSIONS_COLLECTION, StorageError,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Sink that records every flush attempt and can be told to fail or lag
#[derive(Default)]
struct RecordingSink {
    attempts: Mutex<Vec<String>>,
    fail: bool,
    delay: Option<Duration>,
}

impl RecordingSink {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    fn attempts_for(&self, session_id: &str) -> usize {
        self.attempts
            .lock()
            .iter()
            .filter(|id| id.as_str() == session_id)
            .count()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn flush(&self, session_id: &str) -> Result<(), SinkError> {
        self.attempts.lock().push(session_id.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            Err(SinkError::Unavailable("object storage offline".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Sink whose flush never completes
struct HangingSink;

#[async_trait]
impl BatchSink for HangingSink {
    async fn flush(&self, _session_id: &str) -> Result<(), SinkError> {
        std::future::pending().await
    }
}

/// Store that is unreachable
struct FailingStore;

#[async_trait]
impl DocumentStore for FailingStore {
    async fn put(&self, _: &str, _: &str, _: Value) -> Result<(), StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }

    async fn get(&self, _: &str, _: &str) -> Result<Option<Value>, StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }

    async fn query(&self, _: &str, _: &DocumentFilter) -> Result<Vec<Value>, StorageError> {
        Err(StorageError::ConnectionError("connection refused".to_string()))
    }
}

fn limits(daily: u32, concurrent: usize, duration_ms: u64, activity: u64) -> SessionLimits {
    SessionLimits {
        max_daily_sessions_per_user: daily,
        max_concurrent_sessions: concurrent,
        max_session_duration_ms: duration_ms,
        max_activity_per_session: activity,
    }
}

fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
    Local
        .with_ymd_and_hms(y, m, d, h, min, s)
        .earliest()
        .unwrap()
        .with_timezone(&Utc)
}

fn active_ids(sessions: &[pmp_session_gate::session::Session]) -> HashSet<String> {
    sessions.iter().map(|s| s.session_id.clone()).collect()
}

#[tokio::test]
async fn test_preemption_and_capacity_scenario() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(2, 2, 1000, 5),
        ManagerSettings::default(),
    );

    let a = manager.start("u1").await.unwrap();
    assert_eq!(manager.list_active().await.len(), 1);

    let b = manager.start("u1").await.unwrap();
    let active = manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active_ids(&active), HashSet::from([b.clone()]));

    let preempted = manager.get_session(&a).await.unwrap();
    assert_eq!(preempted.status, SessionStatus::Stopped);
    assert_eq!(preempted.stop_reason, Some(StopReason::Preempted));

    let c = manager.start("u2").await.unwrap();
    assert_eq!(manager.list_active().await.len(), 2);

    let result = manager.start("u3").await;
    assert_eq!(result, Err(SessionError::CapacityExceeded { limit: 2 }));

    let active = manager.list_active().await;
    assert_eq!(active_ids(&active), HashSet::from([b, c]));
}

#[tokio::test]
async fn test_activity_limit_stops_session_with_one_flush() {
    let sink = Arc::new(RecordingSink::default());
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        sink.clone(),
        limits(2, 2, 60_000, 5),
        ManagerSettings::default(),
    );

    let b = manager.start("u1").await.unwrap();
    manager.record_activity(&b, 5).await;

    assert!(manager.list_active().await.is_empty());
    let stopped = manager.get_session(&b).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::ActivityLimit));
    assert_eq!(stopped.activity_count, 5);
    assert_eq!(sink.attempts_for(&b), 1);

    // Late activity and an explicit stop after the cap change nothing
    manager.record_activity(&b, 1).await;
    manager.stop(&b).await;
    assert_eq!(sink.attempts_for(&b), 1);
}

#[tokio::test]
async fn test_activity_below_limit_keeps_session() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(2, 2, 60_000, 5),
        ManagerSettings::default(),
    );

    let id = manager.start("u1").await.unwrap();
    manager.record_activity(&id, 2).await;
    manager.record_activity(&id, 2).await;

    let active = manager.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].activity_count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_session_expires_without_activity() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(2, 2, 1000, 5),
        ManagerSettings::default(),
    );

    let id = manager.start("u1").await.unwrap();
    assert_eq!(manager.health_check().await.active_sessions, 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let report = manager.health_check().await;
    assert_eq!(report.active_sessions, 0);
    assert_eq!(report.distinct_users, 0);

    let expired = manager.get_session(&id).await.unwrap();
    assert_eq!(expired.stop_reason, Some(StopReason::Expired));
    assert_eq!(manager.pending_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_daily_counter_resets_at_local_midnight() {
    let clock = Arc::new(ManualClock::new(local(2026, 6, 15, 23, 59, 59)));
    let manager = SessionManager::with_clock(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(1, 5, 60_000, 100),
        ManagerSettings::default(),
        clock.clone(),
    );

    let first = manager.start("u1").await.unwrap();
    manager.stop(&first).await;
    assert!(matches!(
        manager.start("u1").await,
        Err(SessionError::QuotaExceeded { .. })
    ));

    let scheduler = LifecycleScheduler::spawn(manager.clone(), SchedulerSettings::default());
    tokio::time::sleep(Duration::from_millis(500)).await;

    clock.advance(chrono::Duration::seconds(1));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(manager.get_user_stats("u1").await.daily_count, 0);
    assert!(manager.start("u1").await.is_ok());

    scheduler.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_midnight_job_clears_counters() {
    // The clock stays put, so only the scheduled reset can free the quota
    let clock = Arc::new(ManualClock::new(local(2026, 6, 15, 23, 59, 59)));
    let manager = SessionManager::with_clock(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(1, 5, 60_000, 100),
        ManagerSettings::default(),
        clock,
    );

    let first = manager.start("u1").await.unwrap();
    manager.stop(&first).await;

    let scheduler = LifecycleScheduler::spawn(manager.clone(), SchedulerSettings::default());
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(manager.start("u1").await.is_ok());
    scheduler.shutdown();
}

#[tokio::test]
async fn test_quota_rejection_leaves_state_unchanged() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(2, 5, 60_000, 100),
        ManagerSettings::default(),
    );

    manager.start("u1").await.unwrap();
    let current = manager.start("u1").await.unwrap();

    let before = manager.get_user_stats("u1").await;
    let result = manager.start("u1").await;

    assert_eq!(
        result,
        Err(SessionError::QuotaExceeded {
            user_id: "u1".to_string(),
            limit: 2
        })
    );
    let after = manager.get_user_stats("u1").await;
    assert_eq!(before, after);
    assert_eq!(after.daily_count, 2);
    assert_eq!(
        active_ids(&manager.list_active().await),
        HashSet::from([current])
    );
}

#[tokio::test]
async fn test_stop_twice_is_noop() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        SessionLimits::default(),
        ManagerSettings::default(),
    );

    let id = manager.start("u1").await.unwrap();
    manager.start("u2").await.unwrap();

    manager.stop(&id).await;
    let size = manager.list_active().await.len();
    manager.stop(&id).await;
    manager.stop("never-existed").await;

    assert_eq!(manager.list_active().await.len(), size);
}

#[tokio::test]
async fn test_flush_failure_still_terminates() {
    let sink = Arc::new(RecordingSink::failing());
    let store = Arc::new(MemoryDocumentStore::new());
    let manager = SessionManager::new(
        store.clone(),
        sink.clone(),
        SessionLimits::default(),
        ManagerSettings::default(),
    );
    let before = metrics::flush_failure_count("unavailable");

    let id = manager.start("u1").await.unwrap();
    manager.stop(&id).await;

    assert!(manager.list_active().await.is_empty());
    assert_eq!(sink.attempts_for(&id), 1);
    assert!(metrics::flush_failure_count("unavailable") > before);

    let doc = store.get(SESSIONS_COLLECTION, &id).await.unwrap().unwrap();
    assert_eq!(doc["status"], "stopped");
    assert!(doc["flush_error"].as_str().unwrap().contains("object storage offline"));
}

#[tokio::test]
async fn test_store_failure_during_start_proceeds_memory_only() {
    let manager = SessionManager::new(
        Arc::new(FailingStore),
        Arc::new(MemoryBatchSink::new()),
        SessionLimits::default(),
        ManagerSettings::default(),
    );
    let before = metrics::mirror_failure_count("start");

    let id = manager.start("u1").await.unwrap();

    assert_eq!(manager.list_active().await.len(), 1);
    assert!(metrics::mirror_failure_count("start") > before);

    manager.record_activity(&id, 3).await;
    let stats = manager.get_user_stats("u1").await;
    assert_eq!(stats.active_count, 1);
    assert_eq!(stats.total_activity_today, 3);

    let report = manager.health_check().await;
    assert_eq!(report.status, HealthStatus::Error);
    assert!(!report.store_reachable);
    assert_eq!(report.active_sessions, 1);

    manager.stop(&id).await;
    assert!(manager.list_active().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_keep_invariants() {
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(MemoryBatchSink::new()),
        limits(100, 3, 60_000, 1000),
        ManagerSettings::default(),
    );

    let mut handles = Vec::new();
    for i in 0..40 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let user = format!("u{}", i % 5);
            let _ = manager.start(&user).await;
            manager.list_active().await.len()
        }));
    }

    for handle in handles {
        assert!(handle.await.unwrap() <= 3);
    }

    let active = manager.list_active().await;
    assert!(active.len() <= 3);
    let users: HashSet<String> = active.iter().map(|s| s.user_id.clone()).collect();
    assert_eq!(users.len(), active.len());
}

#[tokio::test]
async fn test_restart_recovers_orphaned_sessions() {
    let store = Arc::new(MemoryDocumentStore::new());

    let first = SessionManager::new(
        store.clone(),
        Arc::new(MemoryBatchSink::new()),
        SessionLimits::default(),
        ManagerSettings::default(),
    );
    let orphan = first.start("u1").await.unwrap();
    // Simulated crash: the first manager never stops its session
    drop(first);

    let sink = Arc::new(RecordingSink::default());
    let second = SessionManager::new(
        store.clone(),
        sink.clone(),
        SessionLimits::default(),
        ManagerSettings::default(),
    );

    assert_eq!(second.recover_orphans().await, 1);
    assert_eq!(sink.attempts_for(&orphan), 1);

    let doc = store.get(SESSIONS_COLLECTION, &orphan).await.unwrap().unwrap();
    assert_eq!(doc["status"], "stopped");
    assert_eq!(doc["stop_reason"], "recovered");
}

#[tokio::test(start_paused = true)]
async fn test_hung_flush_does_not_stall_other_sessions() {
    let settings = ManagerSettings::default();
    let manager = SessionManager::new(
        Arc::new(MemoryDocumentStore::new()),
        Arc::new(HangingSink),
        SessionLimits::default(),
        settings.clone(),
    );

    let a = manager.start("u1").await.unwrap();
    let b = manager.start("u2").await.unwrap();

    let stopping = tokio::spawn({
        let manager = manager.clone();
        let a = a.clone();
        async move { manager.stop(&a).await }
    });
    // Wait until the stop has claimed the session and sits in its flush
    while manager.list_active().await.len() != 1 {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    let report = manager.health_check().await;
    assert!(started.elapsed() < Duration::from_millis(settings.health_probe_timeout_ms));
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.active_sessions, 2);
    assert_eq!(report.distinct_users, 1);

    // Other sessions are served while the flush hangs
    manager.record_activity(&b, 3).await;
    let c = manager.start("u3").await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);

    // The flush times out and the stop completes anyway
    stopping.await.unwrap();
    assert_eq!(
        active_ids(&manager.list_active().await),
        HashSet::from([b.clone(), c])
    );
    let stopped = manager.get_session(&a).await.unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.flush_error.unwrap().contains("timed out"));
    assert_eq!(manager.get_session(&b).await.unwrap().activity_count, 3);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_timer_and_sweep_on_same_session_flush_once() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let sink = Arc::new(RecordingSink::slow(Duration::from_millis(200)));
    let manager = SessionManager::with_clock(
        Arc::new(MemoryDocumentStore::new()),
        sink.clone(),
        limits(10, 5, 60_000, 100),
        ManagerSettings::default(),
        clock.clone(),
    );

    let scheduler = LifecycleScheduler::spawn(
        manager.clone(),
        SchedulerSettings {
            sweep_interval_secs: 60,
            daily_reset_enabled: false,
        },
    );
    let id = manager.start("u1").await.unwrap();

    // Wall clock and timer reach the deadline together with the sweep tick
    clock.advance(chrono::Duration::seconds(60));
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(sink.attempts_for(&id), 1);
    assert_eq!(manager.pending_timers(), 0);
    assert!(manager.list_active().await.is_empty());

    let stopped = manager.get_session(&id).await.unwrap();
    assert!(matches!(
        stopped.stop_reason,
        Some(StopReason::Expired) | Some(StopReason::Swept)
    ));

    scheduler.shutdown();
}
