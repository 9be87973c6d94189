pub mod prometheus_metrics;

pub use prometheus_metrics::{
    METRICS_REGISTRY, MetricsRegistry, flush_failure_count, mirror_failure_count,
    record_activity, record_active_sessions, record_admission_rejected, record_flush_failure,
    record_mirror_failure, record_session_started, record_session_stopped,
};
