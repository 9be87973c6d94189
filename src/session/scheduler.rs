// Background jobs: periodic expiry sweep and the local-midnight quota reset

use super::manager::SessionManager;
use crate::clock::next_local_midnight;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval, sleep};
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between expiry sweeps
    pub sweep_interval_secs: u64,
    pub daily_reset_enabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            daily_reset_enabled: true,
        }
    }
}

/// Handles to the running background jobs. Dropping it leaves them running.
pub struct LifecycleScheduler {
    sweep: JoinHandle<()>,
    daily_reset: Option<JoinHandle<()>>,
}

impl LifecycleScheduler {
    /// Start the background jobs on the current runtime
    pub fn spawn(manager: Arc<SessionManager>, settings: SchedulerSettings) -> Self {
        info!(
            "Starting session scheduler (sweep every {}s, daily reset {})",
            settings.sweep_interval_secs,
            if settings.daily_reset_enabled { "on" } else { "off" }
        );

        let sweep = tokio::spawn(run_sweep(
            manager.clone(),
            Duration::from_secs(settings.sweep_interval_secs.max(1)),
        ));

        let daily_reset = settings
            .daily_reset_enabled
            .then(|| tokio::spawn(run_daily_reset(manager)));

        Self { sweep, daily_reset }
    }

    /// Stop the background jobs
    pub fn shutdown(self) {
        self.sweep.abort();
        if let Some(handle) = self.daily_reset {
            handle.abort();
        }
        info!("Session scheduler stopped");
    }
}

/// Safety net for sessions whose expiry timer was lost
async fn run_sweep(manager: Arc<SessionManager>, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let stopped = manager.sweep_expired().await;
        debug!("Expiry sweep finished, {} sessions stopped", stopped);
    }
}

/// Resets counters for the date each midnight opens, at most once per date,
/// so a timer firing slightly early cannot reset twice.
async fn run_daily_reset(manager: Arc<SessionManager>) {
    let clock = manager.clock();
    let mut last_reset: Option<NaiveDate> = None;

    loop {
        let now = clock.now();
        let midnight = next_local_midnight(now);
        let wait = (midnight - now).to_std().unwrap_or(Duration::ZERO);
        debug!("Next daily reset at {} (in {:?})", midnight, wait);

        sleep(wait).await;

        let day = midnight.with_timezone(&Local).date_naive();
        if last_reset == Some(day) {
            continue;
        }
        manager.reset_daily_on(day).await;
        last_reset = Some(day);
    }
}
