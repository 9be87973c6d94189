pub mod checks;

pub use checks::{HealthCheck, HealthCheckResult, StoreHealthCheck};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Share of the concurrency cap above which the manager reports a warning
pub const WARNING_UTILIZATION: f64 = 0.8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Error => write!(f, "error"),
        }
    }
}

/// Point-in-time health snapshot of the session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_sessions: usize,
    pub distinct_users: usize,
    pub memory_mb: f64,
    pub store_reachable: bool,
    pub checked_at: DateTime<Utc>,
    pub probe_duration_ms: u64,
}

impl HealthReport {
    pub fn status_for(
        active_sessions: usize,
        max_concurrent_sessions: usize,
        store_reachable: bool,
    ) -> HealthStatus {
        if !store_reachable {
            HealthStatus::Error
        } else if active_sessions as f64 > max_concurrent_sessions as f64 * WARNING_UTILIZATION {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Resident set size of this process in MiB, 0.0 where unavailable
pub fn resident_memory_mb() -> f64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| parse_vm_rss_kb(&status))
        .map(|kb| kb as f64 / 1024.0)
        .unwrap_or(0.0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}
