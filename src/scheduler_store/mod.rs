mod models;
mod schema;
mod sqlite_scheduler_store;

pub use models::*;
pub use schema::SCHEDULER_VERSIONED_SCHEMAS;
pub use sqlite_scheduler_store::SqliteSchedulerStore;

use anyhow::Result;

/// Durable "last successful completion" state, one row per job.
///
/// Implementations must not cache: every call reads the backing datastore.
pub trait RunMarkerStore: Send + Sync {
    fn get_run_marker(&self, job_name: &str) -> Result<Option<RunMarker>>;
    fn upsert_run_marker(&self, marker: &RunMarker) -> Result<()>;
    fn list_run_markers(&self) -> Result<Vec<RunMarker>>;
}

/// Named, non-blocking advisory lock shared by every process using the datastore.
pub trait DistributedMutex: Send + Sync {
    /// Returns `Ok(None)` when another holder owns `name`. Never waits for it.
    fn try_acquire(&self, name: &str) -> Result<Option<LockLease>>;

    /// Fails if the lease is no longer held by its holder (e.g. it expired and
    /// was taken over).
    fn release(&self, lease: LockLease) -> Result<()>;
}

pub trait RunHistoryStore: Send + Sync {
    fn record_run(&self, run: &NewJobRun) -> Result<i64>;
    fn get_job_history(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>>;
    /// Keep only the newest `keep` rows for `job_name`. Returns rows deleted.
    fn prune_job_history(&self, job_name: &str, keep: usize) -> Result<usize>;
}
