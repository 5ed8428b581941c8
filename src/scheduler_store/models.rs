use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Last successful completion state of one job.
///
/// A missing row and a row with `last_run_at == None` both mean "never run".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunMarker {
    pub job_name: String,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Only meaningful for period-based jobs.
    pub last_completed_period: Option<NaiveDate>,
}

impl RunMarker {
    pub fn never_run(job_name: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            last_run_at: None,
            last_completed_period: None,
        }
    }
}

/// Proof of a successful `try_acquire`.
///
/// Not clonable: handing it back to `release` consumes it, so a lease can be
/// released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Executed,
    Failed,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Executed => "executed",
            JobRunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "executed" => Some(JobRunStatus::Executed),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

/// A job invocation that reached execution, as written to the history table.
#[derive(Debug, Clone)]
pub struct NewJobRun {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobRunStatus,
    pub processed: u64,
    pub failed_items: u64,
    pub first_period: Option<NaiveDate>,
    pub last_period: Option<NaiveDate>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub id: i64,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: JobRunStatus,
    pub processed: u64,
    pub failed_items: u64,
    pub first_period: Option<NaiveDate>,
    pub last_period: Option<NaiveDate>,
    pub error: Option<String>,
}
