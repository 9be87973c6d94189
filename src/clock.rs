// Time source for session timestamps and the local-midnight boundary

use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Current local calendar date (the key for daily counters)
    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock, used to step across deadlines and midnight in tests
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// First instant of the local day following `now`.
///
/// Falls back to `now + 24h` if local midnight does not exist (DST gap).
pub fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let tomorrow = local
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(local.date_naive());

    local_midnight(tomorrow).unwrap_or(now + chrono::Duration::hours(24))
}

/// Start of the given local date as a UTC instant
pub fn local_midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    let naive = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Local
            .with_ymd_and_hms(y, m, d, h, min, s)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_next_midnight_one_second_before() {
        let now = local(2026, 6, 15, 23, 59, 59);
        let next = next_local_midnight(now);

        assert_eq!(next - now, chrono::Duration::seconds(1));
        assert_eq!(
            next.with_timezone(&Local).date_naive(),
            NaiveDate::from_ymd_opt(2026, 6, 16).unwrap()
        );
    }

    #[test]
    fn test_next_midnight_at_midnight_is_next_day() {
        let now = local(2026, 6, 16, 0, 0, 0);
        let next = next_local_midnight(now);

        assert!(next > now);
        assert_eq!(
            next.with_timezone(&Local).date_naive(),
            NaiveDate::from_ymd_opt(2026, 6, 17).unwrap()
        );
    }

    #[test]
    fn test_manual_clock_advance_changes_day() {
        let clock = ManualClock::new(local(2026, 6, 15, 23, 59, 59));
        let before = clock.today();

        clock.advance(chrono::Duration::seconds(1));

        assert_eq!(clock.today(), before.succ_opt().unwrap());
    }
}
