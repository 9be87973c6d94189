use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}

pub struct MetricsRegistry {
    pub registry: Registry,

    // Lifecycle
    pub sessions_started_total: IntCounter,
    pub sessions_stopped_total: IntCounterVec,
    pub active_sessions: IntGauge,
    pub session_activity_total: IntCounter,

    // Admission control
    pub admission_rejections_total: IntCounterVec,

    // Degraded dependencies
    pub flush_failures_total: IntCounterVec,
    pub mirror_failures_total: IntCounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sessions_started_total = IntCounter::with_opts(Opts::new(
            "sessions_started_total",
            "Total number of sessions admitted",
        ))
        .unwrap();

        let sessions_stopped_total = IntCounterVec::new(
            Opts::new("sessions_stopped_total", "Total number of sessions stopped"),
            &["reason"],
        )
        .unwrap();

        let active_sessions = IntGauge::with_opts(Opts::new(
            "active_sessions",
            "Number of sessions currently in the registry",
        ))
        .unwrap();

        let session_activity_total = IntCounter::with_opts(Opts::new(
            "session_activity_total",
            "Total activity units recorded across sessions",
        ))
        .unwrap();

        let admission_rejections_total = IntCounterVec::new(
            Opts::new(
                "session_admission_rejections_total",
                "Total number of rejected session starts",
            ),
            &["kind"],
        )
        .unwrap();

        let flush_failures_total = IntCounterVec::new(
            Opts::new(
                "session_flush_failures_total",
                "Total number of batch sink flushes that failed at termination",
            ),
            &["kind"],
        )
        .unwrap();

        let mirror_failures_total = IntCounterVec::new(
            Opts::new(
                "session_mirror_failures_total",
                "Total number of failed durable mirror writes",
            ),
            &["op"],
        )
        .unwrap();

        registry
            .register(Box::new(sessions_started_total.clone()))
            .unwrap();
        registry
            .register(Box::new(sessions_stopped_total.clone()))
            .unwrap();
        registry
            .register(Box::new(active_sessions.clone()))
            .unwrap();
        registry
            .register(Box::new(session_activity_total.clone()))
            .unwrap();
        registry
            .register(Box::new(admission_rejections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(flush_failures_total.clone()))
            .unwrap();
        registry
            .register(Box::new(mirror_failures_total.clone()))
            .unwrap();

        Self {
            registry,
            sessions_started_total,
            sessions_stopped_total,
            active_sessions,
            session_activity_total,
            admission_rejections_total,
            flush_failures_total,
            mirror_failures_total,
        }
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Convenience functions for common metrics operations

pub fn record_session_started() {
    METRICS_REGISTRY.sessions_started_total.inc();
}

pub fn record_session_stopped(reason: &str) {
    METRICS_REGISTRY
        .sessions_stopped_total
        .with_label_values(&[reason])
        .inc();
}

pub fn record_active_sessions(count: usize) {
    METRICS_REGISTRY.active_sessions.set(count as i64);
}

pub fn record_activity(count: u64) {
    METRICS_REGISTRY.session_activity_total.inc_by(count);
}

pub fn record_admission_rejected(kind: &str) {
    METRICS_REGISTRY
        .admission_rejections_total
        .with_label_values(&[kind])
        .inc();
}

pub fn record_flush_failure(kind: &str) {
    METRICS_REGISTRY
        .flush_failures_total
        .with_label_values(&[kind])
        .inc();
}

pub fn record_mirror_failure(op: &str) {
    METRICS_REGISTRY
        .mirror_failures_total
        .with_label_values(&[op])
        .inc();
}

/// Current flush failure count for a kind (for reporting and tests)
pub fn flush_failure_count(kind: &str) -> u64 {
    METRICS_REGISTRY
        .flush_failures_total
        .with_label_values(&[kind])
        .get()
}

/// Current mirror failure count for an operation
pub fn mirror_failure_count(op: &str) -> u64 {
    METRICS_REGISTRY
        .mirror_failures_total
        .with_label_values(&[op])
        .get()
}
