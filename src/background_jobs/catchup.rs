//! Catch-up planning for period-based jobs.
//!
//! Given the last period whose artifact was produced and the latest closed
//! period, decide which periods to run now, oldest first, bounded by a
//! lookback window. Periods older than the window are dropped for good.

use super::job::{PeriodGranularity, TaskError, TaskOutcome};
use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatchupPlan {
    pub periods: Vec<NaiveDate>,
}

impl CatchupPlan {
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }
}

/// Plan the periods to run.
///
/// * nothing completed yet: only `boundary`
/// * otherwise: every period after `last_completed` up to `boundary`,
///   keeping at most the newest `max_lookback` of them
///
/// A `last_completed` at or after `boundary` yields an empty plan.
pub fn plan(
    last_completed: Option<NaiveDate>,
    boundary: NaiveDate,
    max_lookback: u32,
    granularity: PeriodGranularity,
) -> CatchupPlan {
    let boundary = granularity.period_containing(boundary);
    let max_lookback = max_lookback.max(1);

    let Some(last_completed) = last_completed else {
        return CatchupPlan {
            periods: vec![boundary],
        };
    };

    let after_last = granularity.next(granularity.period_containing(last_completed));
    let window_start = granularity.step_back(boundary, max_lookback - 1);
    let mut period = after_last.max(window_start);

    let mut periods = Vec::new();
    while period <= boundary && periods.len() < max_lookback as usize {
        periods.push(period);
        let next = granularity.next(period);
        if next <= period {
            break;
        }
        period = next;
    }
    CatchupPlan { periods }
}

/// Outcome of running a plan in order.
#[derive(Debug, Default)]
pub struct CatchupResult {
    /// Periods that succeeded, in execution order.
    pub completed: Vec<NaiveDate>,
    pub outcome: TaskOutcome,
    /// The first period that failed; later periods were not attempted.
    pub failure: Option<(NaiveDate, TaskError)>,
}

impl CatchupResult {
    pub fn last_succeeded(&self) -> Option<NaiveDate> {
        self.completed.last().copied()
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run `run_period` for each planned period, stopping at the first failure so
/// the completed prefix stays contiguous.
pub fn execute_plan<F>(plan: &CatchupPlan, mut run_period: F) -> CatchupResult
where
    F: FnMut(NaiveDate) -> Result<TaskOutcome, TaskError>,
{
    let mut result = CatchupResult::default();
    for &period in &plan.periods {
        match run_period(period) {
            Ok(outcome) => {
                result.outcome.merge(outcome);
                result.completed.push(period);
            }
            Err(err) => {
                result.failure = Some((period, err));
                break;
            }
        }
    }
    result
}
