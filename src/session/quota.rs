// Per-user daily session counters

use super::types::SessionLimits;
use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::info;

/// In-memory per-user daily counters.
///
/// Counters belong to one local calendar date. Reads made on a later date see
/// zero without mutating anything, so a missed midnight reset cannot lock
/// users out; the next write rolls the counters over.
#[derive(Debug)]
pub struct QuotaTracker {
    day: NaiveDate,
    counts: HashMap<String, u32>,
}

impl QuotaTracker {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            day: today,
            counts: HashMap::new(),
        }
    }

    /// Sessions the user started on `today`
    pub fn daily_count(&self, user_id: &str, today: NaiveDate) -> u32 {
        if today != self.day {
            return 0;
        }
        self.counts.get(user_id).copied().unwrap_or(0)
    }

    /// Whether the user may start another session today. Side-effect free.
    pub fn can_start_daily(&self, user_id: &str, today: NaiveDate, limits: &SessionLimits) -> bool {
        self.daily_count(user_id, today) < limits.max_daily_sessions_per_user
    }

    /// Whether a new session fits under the global concurrency cap
    pub fn can_start_concurrent(&self, active_sessions: usize, limits: &SessionLimits) -> bool {
        active_sessions < limits.max_concurrent_sessions
    }

    pub fn record_daily_start(&mut self, user_id: &str, today: NaiveDate) {
        self.roll_over(today);
        *self.counts.entry(user_id.to_string()).or_insert(0) += 1;
    }

    /// Clear all counters and start counting for `today`
    pub fn reset_daily(&mut self, today: NaiveDate) {
        let users = self.counts.len();
        self.counts.clear();
        self.day = today;
        info!("Daily session counters reset for {} ({} users)", today, users);
    }

    fn roll_over(&mut self, today: NaiveDate) {
        if today != self.day {
            self.reset_daily(today);
        }
    }
}
