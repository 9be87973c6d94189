use crate::storage::DocumentStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub passed: bool,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl HealthCheckResult {
    pub fn passed(name: String, duration_ms: u64) -> Self {
        Self {
            name,
            passed: true,
            message: None,
            checked_at: Utc::now(),
            duration_ms,
        }
    }

    pub fn failed(name: String, message: String, duration_ms: u64) -> Self {
        Self {
            name,
            passed: false,
            message: Some(message),
            checked_at: Utc::now(),
            duration_ms,
        }
    }
}

/// Health check trait
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Name of the health check
    fn name(&self) -> &str;

    /// Perform the health check
    async fn check(&self) -> HealthCheckResult;

    /// Timeout for this health check
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

/// Durable store reachability probe: one bounded round trip
pub struct StoreHealthCheck {
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl StoreHealthCheck {
    pub fn new(store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl HealthCheck for StoreHealthCheck {
    fn name(&self) -> &str {
        "document_store"
    }

    async fn check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();

        let result = timeout(self.timeout(), self.store.ping()).await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => HealthCheckResult::passed(self.name().to_string(), duration_ms),
            Ok(Err(e)) => {
                error!("Document store health check failed: {}", e);
                HealthCheckResult::failed(
                    self.name().to_string(),
                    format!("Store error: {}", e),
                    duration_ms,
                )
            }
            Err(_) => {
                error!("Document store health check timed out");
                HealthCheckResult::failed(
                    self.name().to_string(),
                    "Probe timeout".to_string(),
                    duration_ms,
                )
            }
        }
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
