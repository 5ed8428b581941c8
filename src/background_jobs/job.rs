use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest interval a descriptor accepts, whatever the configuration says.
pub const MIN_JOB_INTERVAL: Duration = Duration::from_secs(1);

/// Length of one period of a period-based job.
///
/// Periods are identified by their first day, computed in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodGranularity {
    Day,
    /// ISO week, starting on Monday.
    Week,
    Month,
}

impl PeriodGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeriodGranularity::Day => "day",
            PeriodGranularity::Week => "week",
            PeriodGranularity::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(PeriodGranularity::Day),
            "week" => Some(PeriodGranularity::Week),
            "month" => Some(PeriodGranularity::Month),
            _ => None,
        }
    }

    /// First day of the period containing `date`.
    pub fn period_containing(&self, date: NaiveDate) -> NaiveDate {
        match self {
            PeriodGranularity::Day => date,
            PeriodGranularity::Week => {
                let offset = date.weekday().num_days_from_monday() as u64;
                date.checked_sub_days(Days::new(offset)).unwrap_or(date)
            }
            PeriodGranularity::Month => date.with_day(1).unwrap_or(date),
        }
    }

    pub fn next(&self, period: NaiveDate) -> NaiveDate {
        let next = match self {
            PeriodGranularity::Day => period.checked_add_days(Days::new(1)),
            PeriodGranularity::Week => period.checked_add_days(Days::new(7)),
            PeriodGranularity::Month => period.checked_add_months(Months::new(1)),
        };
        next.unwrap_or(NaiveDate::MAX)
    }

    /// The period `count` steps before `period`.
    pub fn step_back(&self, period: NaiveDate, count: u32) -> NaiveDate {
        let earlier = match self {
            PeriodGranularity::Day => period.checked_sub_days(Days::new(count as u64)),
            PeriodGranularity::Week => period.checked_sub_days(Days::new(7 * count as u64)),
            PeriodGranularity::Month => period.checked_sub_months(Months::new(count)),
        };
        earlier.unwrap_or(NaiveDate::MIN)
    }

    /// Latest period allowed to run at `now`: the last fully closed one.
    pub fn boundary_period(&self, now: DateTime<Utc>) -> NaiveDate {
        self.step_back(self.period_containing(now.date_naive()), 1)
    }
}

impl std::fmt::Display for PeriodGranularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Simple,
    /// One artifact per period; missed periods are caught up, oldest first.
    PeriodBased {
        granularity: PeriodGranularity,
        max_lookback_periods: u32,
    },
}

/// Static description of a job, built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    name: String,
    mutex_name: String,
    interval: Duration,
    kind: JobKind,
    enabled: bool,
}

impl JobDescriptor {
    pub fn simple(name: &str, interval: Duration) -> Self {
        Self::new(name, interval, JobKind::Simple)
    }

    pub fn period_based(
        name: &str,
        interval: Duration,
        granularity: PeriodGranularity,
        max_lookback_periods: u32,
    ) -> Self {
        Self::new(
            name,
            interval,
            JobKind::PeriodBased {
                granularity,
                max_lookback_periods: max_lookback_periods.max(1),
            },
        )
    }

    fn new(name: &str, interval: Duration, kind: JobKind) -> Self {
        Self {
            name: name.to_string(),
            mutex_name: format!("tickgate:job:{}", name),
            interval: interval.max(MIN_JOB_INTERVAL),
            kind,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mutex_name(&self) -> &str {
        &self.mutex_name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// What a task body gets to see about the invocation it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskContext {
    pub job_name: String,
    /// The instant the scheduler evaluated the gate with.
    pub scheduled_at: DateTime<Utc>,
    /// Set for period-based jobs: the period being produced.
    pub period: Option<NaiveDate>,
}

/// Aggregate result of one successful task body invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOutcome {
    /// Items handled successfully.
    pub processed: u64,
    /// Items that failed without failing the invocation as a whole.
    pub failed: u64,
}

impl TaskOutcome {
    pub fn merge(&mut self, other: TaskOutcome) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task body panicked: {0}")]
    Panicked(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// The unit of work behind a job.
///
/// Bodies run on a blocking thread. They must bound their own work (batch
/// caps), because nothing in the scheduler interrupts them once started.
pub trait TaskBody: Send + Sync {
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError>;
}

impl<F> TaskBody for F
where
    F: Fn(&TaskContext) -> Result<TaskOutcome, TaskError> + Send + Sync,
{
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        self(ctx)
    }
}
