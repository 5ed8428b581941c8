use chrono::{DateTime, Utc};
use std::time::Duration;

/// Pure eligibility rule: a job may run when it never ran, or when at least
/// its interval has elapsed since the last successful run.
///
/// A `last_run_at` in the future (clock skew between hosts) keeps the job
/// ineligible until `now` catches up with it plus the interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalGate {
    interval: Duration,
}

impl IntervalGate {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_eligible(&self, last_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last_run_at) = last_run_at else {
            return true;
        };
        match chrono::Duration::from_std(self.interval) {
            Ok(interval) => match last_run_at.checked_add_signed(interval) {
                Some(next_due) => now >= next_due,
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Instant from which `is_eligible` turns true, `None` when it already is.
    pub fn next_due(&self, last_run_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.interval).ok()?;
        last_run_at?.checked_add_signed(interval)
    }
}
