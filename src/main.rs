use pmp_session_gate::config;
use pmp_session_gate::health::HealthStatus;
use pmp_session_gate::metrics::METRICS_REGISTRY;
use pmp_session_gate::session::{LifecycleScheduler, SessionManager};
use pmp_session_gate::sink::MemoryBatchSink;
use pmp_session_gate::storage::create_document_store;
use std::sync::Arc;
use tokio::time::{Duration, interval};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pmp_session_gate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = config::load_config_with_fallback();
    if let Err(e) = config.validate() {
        tracing::error!("Refusing to start with invalid configuration: {}", e);
        std::process::exit(1);
    }

    let store = create_document_store(&config.storage);
    let sink = Arc::new(MemoryBatchSink::new());
    let manager = SessionManager::new(
        store,
        sink,
        config.limits.clone(),
        config.manager.clone(),
    );

    let recovered = manager.recover_orphans().await;
    if recovered > 0 {
        tracing::warn!(
            "Closed {} sessions left active by a previous run",
            recovered
        );
    }

    let scheduler = LifecycleScheduler::spawn(manager.clone(), config.scheduler.clone());

    tracing::info!(
        "Session gate running ({} concurrent sessions, {} per user per day)",
        config.limits.max_concurrent_sessions,
        config.limits.max_daily_sessions_per_user
    );

    let mut ticker = interval(HEALTH_LOG_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = manager.health_check().await;
                match report.status {
                    HealthStatus::Healthy => tracing::info!(
                        active_sessions = report.active_sessions,
                        distinct_users = report.distinct_users,
                        memory_mb = report.memory_mb,
                        "Health: {}", report.status
                    ),
                    _ => tracing::warn!(
                        active_sessions = report.active_sessions,
                        distinct_users = report.distinct_users,
                        store_reachable = report.store_reachable,
                        "Health: {}", report.status
                    ),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    tracing::info!("Shutting down");
    scheduler.shutdown();
    manager.shutdown().await;

    match METRICS_REGISTRY.render() {
        Ok(text) => tracing::debug!("Final metrics:\n{}", text),
        Err(e) => tracing::warn!("Failed to render metrics: {}", e),
    }
}
