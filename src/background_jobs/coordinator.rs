//! Per-job run protocol.
//!
//! Every invocation walks the same states:
//!
//! ```text
//! Idle -> GateChecked -> Locked -> ReGateChecked -> Executing -> Persisted -> Released
//! ```
//!
//! and may stop early at the gate (not due), at the lock (someone else holds
//! it) or at the re-check (someone else just finished it). Once the lock is
//! acquired it is released on every path out, including a panicking body.

use super::catchup::{self, CatchupResult};
use super::gate::IntervalGate;
use super::job::{JobKind, TaskBody, TaskContext, TaskError, TaskOutcome};
use super::registry::RegisteredJob;
use crate::scheduler_store::{
    DistributedMutex, JobRunStatus, NewJobRun, RunHistoryStore, RunMarker, RunMarkerStore,
};
use crate::server::metrics;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Terminal classification of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// The interval has not elapsed, before or after taking the lock.
    SkippedIneligible,
    /// Another process (or another request in this one) holds the job.
    SkippedLocked,
    /// The marker store or the mutex could not be reached.
    SkippedUnavailable,
    Executed,
    Failed,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::SkippedIneligible => "skipped_ineligible",
            Decision::SkippedLocked => "skipped_locked",
            Decision::SkippedUnavailable => "skipped_unavailable",
            Decision::Executed => "executed",
            Decision::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    GateChecked,
    Locked,
    ReGateChecked,
    Executing,
    Persisted,
    Released,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationReport {
    pub job_name: String,
    pub decision: Decision,
    /// Furthest state reached.
    pub state: CoordinatorState,
    pub processed: u64,
    pub failed_items: u64,
    /// First and last period completed by this invocation.
    pub periods: Option<(NaiveDate, NaiveDate)>,
    pub error: Option<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl InvocationReport {
    pub(crate) fn new(job_name: &str, decision: Decision, state: CoordinatorState) -> Self {
        Self {
            job_name: job_name.to_string(),
            decision,
            state,
            processed: 0,
            failed_items: 0,
            periods: None,
            error: None,
            elapsed: Duration::ZERO,
        }
    }

    fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Runs the gate/lock/re-gate/execute/persist/release protocol for one job.
pub struct JobCoordinator {
    markers: Arc<dyn RunMarkerStore>,
    mutex: Arc<dyn DistributedMutex>,
    history: Option<Arc<dyn RunHistoryStore>>,
    history_retention: usize,
}

impl JobCoordinator {
    pub fn new(markers: Arc<dyn RunMarkerStore>, mutex: Arc<dyn DistributedMutex>) -> Self {
        Self {
            markers,
            mutex,
            history: None,
            history_retention: 0,
        }
    }

    /// Also record every executed or failed invocation, keeping the newest
    /// `retention` rows per job (0 keeps everything).
    pub fn with_history(mut self, history: Arc<dyn RunHistoryStore>, retention: usize) -> Self {
        self.history = Some(history);
        self.history_retention = retention;
        self
    }

    pub fn run(&self, job: &RegisteredJob, now: DateTime<Utc>) -> InvocationReport {
        let start = Instant::now();
        let mut report = self.run_protocol(job, now);
        report.elapsed = start.elapsed();
        publish_report(&report);
        report
    }

    /// Report for a job skipped because this process is already running it.
    pub(crate) fn skip_in_flight(&self, job: &RegisteredJob) -> InvocationReport {
        let report = InvocationReport::new(
            job.descriptor.name(),
            Decision::SkippedLocked,
            CoordinatorState::Idle,
        )
        .with_error("already running in this process");
        publish_report(&report);
        report
    }

    fn run_protocol(&self, job: &RegisteredJob, now: DateTime<Utc>) -> InvocationReport {
        let descriptor = &job.descriptor;
        let name = descriptor.name();
        let gate = IntervalGate::new(descriptor.interval());

        let marker = match self.load_marker(name) {
            Ok(marker) => marker,
            Err(e) => {
                return InvocationReport::new(
                    name,
                    Decision::SkippedUnavailable,
                    CoordinatorState::Idle,
                )
                .with_error(format!("reading run marker: {}", e));
            }
        };
        if !gate.is_eligible(marker.last_run_at, now) {
            return InvocationReport::new(
                name,
                Decision::SkippedIneligible,
                CoordinatorState::GateChecked,
            );
        }

        let lease = match self.mutex.try_acquire(descriptor.mutex_name()) {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                return InvocationReport::new(
                    name,
                    Decision::SkippedLocked,
                    CoordinatorState::GateChecked,
                );
            }
            Err(e) => {
                return InvocationReport::new(
                    name,
                    Decision::SkippedUnavailable,
                    CoordinatorState::GateChecked,
                )
                .with_error(format!("acquiring {}: {}", descriptor.mutex_name(), e));
            }
        };
        debug!(
            job = name,
            holder = %lease.holder,
            expires_at = %lease.expires_at,
            "Acquired job lock"
        );

        let mut report = self.run_locked(job, &gate, now);

        if let Err(e) = self.mutex.release(lease) {
            warn!(job = name, "Failed to release job lock: {}", e);
        }
        report.state = CoordinatorState::Released;
        report
    }

    /// Runs while the lock is held; the caller releases it.
    fn run_locked(
        &self,
        job: &RegisteredJob,
        gate: &IntervalGate,
        now: DateTime<Utc>,
    ) -> InvocationReport {
        let name = job.descriptor.name();

        // Another process may have finished the job between our first read
        // and the acquire.
        let marker = match self.load_marker(name) {
            Ok(marker) => marker,
            Err(e) => {
                return InvocationReport::new(
                    name,
                    Decision::SkippedUnavailable,
                    CoordinatorState::Locked,
                )
                .with_error(format!("re-reading run marker: {}", e));
            }
        };
        if !gate.is_eligible(marker.last_run_at, now) {
            return InvocationReport::new(
                name,
                Decision::SkippedIneligible,
                CoordinatorState::ReGateChecked,
            );
        }

        let started_at = Utc::now();
        let mut report = match job.descriptor.kind() {
            JobKind::Simple => self.execute_simple(job, &marker, now),
            JobKind::PeriodBased {
                granularity,
                max_lookback_periods,
            } => {
                let plan = catchup::plan(
                    marker.last_completed_period,
                    granularity.boundary_period(now),
                    max_lookback_periods,
                    granularity,
                );
                debug!(job = name, periods = ?plan.periods, "Planned catch-up");
                let result = catchup::execute_plan(&plan, |period| {
                    invoke_body(job.body.as_ref(), &task_context(name, now, Some(period)))
                });
                self.complete_periods(name, &marker, result, now)
            }
        };

        if let Some(history) = &self.history {
            self.record_history(history.as_ref(), &report, started_at);
        }
        report
    }

    fn execute_simple(
        &self,
        job: &RegisteredJob,
        marker: &RunMarker,
        now: DateTime<Utc>,
    ) -> InvocationReport {
        let name = job.descriptor.name();
        match invoke_body(job.body.as_ref(), &task_context(name, now, None)) {
            Ok(outcome) => {
                let updated = RunMarker {
                    job_name: name.to_string(),
                    last_run_at: Some(now),
                    last_completed_period: marker.last_completed_period,
                };
                self.persist_success(name, &updated, outcome, None)
            }
            Err(e) => {
                InvocationReport::new(name, Decision::Failed, CoordinatorState::Executing)
                    .with_error(e)
            }
        }
    }

    fn complete_periods(
        &self,
        name: &str,
        marker: &RunMarker,
        result: CatchupResult,
        now: DateTime<Utc>,
    ) -> InvocationReport {
        let periods = result
            .completed
            .first()
            .copied()
            .zip(result.last_succeeded());
        let last_completed_period = result.last_succeeded().or(marker.last_completed_period);
        metrics::record_periods_processed(name, result.completed.len() as u64);

        match result.failure {
            None => {
                let updated = RunMarker {
                    job_name: name.to_string(),
                    last_run_at: Some(now),
                    last_completed_period,
                };
                self.persist_success(name, &updated, result.outcome, periods)
            }
            Some((failed_period, err)) => {
                let mut report =
                    InvocationReport::new(name, Decision::Failed, CoordinatorState::Executing)
                        .with_error(format!("period {}: {}", failed_period, err));
                report.processed = result.outcome.processed;
                report.failed_items = result.outcome.failed;
                report.periods = periods;

                // Keep the progress made, but leave `last_run_at` alone so the
                // next request retries the remaining periods.
                if periods.is_some() {
                    let updated = RunMarker {
                        job_name: name.to_string(),
                        last_run_at: marker.last_run_at,
                        last_completed_period,
                    };
                    match self.markers.upsert_run_marker(&updated) {
                        Ok(()) => report.state = CoordinatorState::Persisted,
                        Err(e) => {
                            error!(job = name, "Failed to persist partial progress: {}", e)
                        }
                    }
                }
                report
            }
        }
    }

    fn persist_success(
        &self,
        name: &str,
        updated: &RunMarker,
        outcome: TaskOutcome,
        periods: Option<(NaiveDate, NaiveDate)>,
    ) -> InvocationReport {
        let mut report =
            InvocationReport::new(name, Decision::Executed, CoordinatorState::Executing);
        report.processed = outcome.processed;
        report.failed_items = outcome.failed;
        report.periods = periods;

        match self.markers.upsert_run_marker(updated) {
            Ok(()) => report.state = CoordinatorState::Persisted,
            Err(e) => {
                // The work happened but the gate will not see it: the next
                // request runs the job again.
                error!(job = name, "Failed to persist run marker: {}", e);
                report.error = Some(format!("persisting run marker: {}", e));
            }
        }
        report
    }

    fn record_history(
        &self,
        history: &dyn RunHistoryStore,
        report: &InvocationReport,
        started_at: DateTime<Utc>,
    ) {
        let status = match report.decision {
            Decision::Executed => JobRunStatus::Executed,
            Decision::Failed => JobRunStatus::Failed,
            _ => return,
        };
        let run = NewJobRun {
            job_name: report.job_name.clone(),
            started_at,
            finished_at: Utc::now(),
            status,
            processed: report.processed,
            failed_items: report.failed_items,
            first_period: report.periods.map(|(first, _)| first),
            last_period: report.periods.map(|(_, last)| last),
            error: report.error.clone(),
        };
        if let Err(e) = history.record_run(&run) {
            warn!(job = %report.job_name, "Failed to record job run: {}", e);
            return;
        }
        if self.history_retention > 0 {
            if let Err(e) = history.prune_job_history(&report.job_name, self.history_retention) {
                warn!(job = %report.job_name, "Failed to prune job history: {}", e);
            }
        }
    }

    fn load_marker(&self, name: &str) -> anyhow::Result<RunMarker> {
        Ok(self
            .markers
            .get_run_marker(name)?
            .unwrap_or_else(|| RunMarker::never_run(name)))
    }
}

fn task_context(name: &str, now: DateTime<Utc>, period: Option<NaiveDate>) -> TaskContext {
    TaskContext {
        job_name: name.to_string(),
        scheduled_at: now,
        period,
    }
}

/// Run a body, turning a panic into an ordinary failure so the caller still
/// reaches the lock release.
pub(crate) fn invoke_body(
    body: &dyn TaskBody,
    ctx: &TaskContext,
) -> Result<TaskOutcome, TaskError> {
    match catch_unwind(AssertUnwindSafe(|| body.execute(ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            };
            Err(TaskError::Panicked(message))
        }
    }
}

/// One metric sample and one log line per invocation, whatever its outcome.
fn publish_report(report: &InvocationReport) {
    metrics::record_scheduler_invocation(
        &report.job_name,
        report.decision.as_str(),
        report.elapsed,
    );
    log_report(report);
}

fn log_report(report: &InvocationReport) {
    let first_period = report.periods.map(|(first, _)| first.to_string());
    let last_period = report.periods.map(|(_, last)| last.to_string());
    match report.decision {
        Decision::Executed => info!(
            job = %report.job_name,
            decision = report.decision.as_str(),
            processed = report.processed,
            failed_items = report.failed_items,
            first_period = ?first_period,
            last_period = ?last_period,
            elapsed_ms = report.elapsed.as_millis() as u64,
            error = ?report.error,
            "Job invocation finished"
        ),
        Decision::Failed => error!(
            job = %report.job_name,
            decision = report.decision.as_str(),
            processed = report.processed,
            first_period = ?first_period,
            last_period = ?last_period,
            elapsed_ms = report.elapsed.as_millis() as u64,
            error = ?report.error,
            "Job invocation failed"
        ),
        Decision::SkippedUnavailable => warn!(
            job = %report.job_name,
            decision = report.decision.as_str(),
            error = ?report.error,
            "Job invocation skipped"
        ),
        Decision::SkippedIneligible | Decision::SkippedLocked => debug!(
            job = %report.job_name,
            decision = report.decision.as_str(),
            state = ?report.state,
            reason = ?report.error,
            "Job invocation skipped"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::job::{JobDescriptor, PeriodGranularity};
    use crate::scheduler_store::{JobRun, LockLease};
    use anyhow::bail;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryMarkers {
        markers: Mutex<HashMap<String, RunMarker>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    impl RunMarkerStore for MemoryMarkers {
        fn get_run_marker(&self, job_name: &str) -> anyhow::Result<Option<RunMarker>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
            Ok(self.markers.lock().unwrap().get(job_name).cloned())
        }

        fn upsert_run_marker(&self, marker: &RunMarker) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                bail!("disk I/O error");
            }
            self.markers
                .lock()
                .unwrap()
                .insert(marker.job_name.clone(), marker.clone());
            Ok(())
        }

        fn list_run_markers(&self) -> anyhow::Result<Vec<RunMarker>> {
            Ok(self.markers.lock().unwrap().values().cloned().collect())
        }
    }

    /// Counts acquires and releases; `held` simulates a foreign holder.
    #[derive(Default)]
    struct CountingMutex {
        held: AtomicBool,
        fail: AtomicBool,
        acquires: AtomicUsize,
        releases: AtomicUsize,
    }

    impl DistributedMutex for CountingMutex {
        fn try_acquire(&self, name: &str) -> anyhow::Result<Option<LockLease>> {
            if self.fail.load(Ordering::SeqCst) {
                bail!("connection refused");
            }
            if self.held.load(Ordering::SeqCst) {
                return Ok(None);
            }
            self.acquires.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(Some(LockLease {
                name: name.to_string(),
                holder: "test".to_string(),
                acquired_at: now,
                expires_at: now,
            }))
        }

        fn release(&self, _lease: LockLease) -> anyhow::Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryHistory {
        runs: Mutex<Vec<NewJobRun>>,
    }

    impl RunHistoryStore for MemoryHistory {
        fn record_run(&self, run: &NewJobRun) -> anyhow::Result<i64> {
            let mut runs = self.runs.lock().unwrap();
            runs.push(run.clone());
            Ok(runs.len() as i64)
        }

        fn get_job_history(&self, _job_name: &str, _limit: usize) -> anyhow::Result<Vec<JobRun>> {
            Ok(vec![])
        }

        fn prune_job_history(&self, _job_name: &str, _keep: usize) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    struct Fixture {
        markers: Arc<MemoryMarkers>,
        mutex: Arc<CountingMutex>,
        history: Arc<MemoryHistory>,
        coordinator: JobCoordinator,
    }

    fn fixture() -> Fixture {
        let markers = Arc::new(MemoryMarkers::default());
        let mutex = Arc::new(CountingMutex::default());
        let history = Arc::new(MemoryHistory::default());
        let coordinator = JobCoordinator::new(markers.clone(), mutex.clone())
            .with_history(history.clone(), 10);
        Fixture {
            markers,
            mutex,
            history,
            coordinator,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn counting_job(
        descriptor: JobDescriptor,
        calls: Arc<AtomicUsize>,
    ) -> RegisteredJob {
        RegisteredJob::new(
            descriptor,
            Arc::new(move |_: &TaskContext| -> Result<TaskOutcome, TaskError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(TaskOutcome {
                    processed: 1,
                    failed: 0,
                })
            }),
        )
    }

    #[test]
    fn test_first_invocation_executes_and_persists() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("reminder_dispatch", Duration::from_secs(600)),
            calls.clone(),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Executed);
        assert_eq!(report.state, CoordinatorState::Released);
        assert_eq!(report.processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.markers
                .get_run_marker("reminder_dispatch")
                .unwrap()
                .unwrap()
                .last_run_at,
            Some(at(0))
        );
        assert_eq!(f.mutex.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(f.mutex.releases.load(Ordering::SeqCst), 1);
        assert_eq!(f.history.runs.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ineligible_job_never_touches_the_lock() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("reminder_dispatch", Duration::from_secs(600)),
            calls.clone(),
        );
        f.coordinator.run(&job, at(0));

        let report = f.coordinator.run(&job, at(300));

        assert_eq!(report.decision, Decision::SkippedIneligible);
        assert_eq!(report.state, CoordinatorState::GateChecked);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.mutex.acquires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_held_lock_skips_without_running() {
        let f = fixture();
        f.mutex.held.store(true, Ordering::SeqCst);
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("external_sync", Duration::from_secs(900)),
            calls.clone(),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::SkippedLocked);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.mutex.releases.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unreachable_store_fails_closed() {
        let f = fixture();
        f.markers.fail_reads.store(true, Ordering::SeqCst);
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("external_sync", Duration::from_secs(900)),
            calls.clone(),
        );

        let report = f.coordinator.run(&job, at(0));
        assert_eq!(report.decision, Decision::SkippedUnavailable);
        assert!(report.error.is_some());

        f.markers.fail_reads.store(false, Ordering::SeqCst);
        f.mutex.fail.store(true, Ordering::SeqCst);
        let report = f.coordinator.run(&job, at(0));
        assert_eq!(report.decision, Decision::SkippedUnavailable);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// A marker store whose first read sees nothing and every later read sees
    /// a fresh run, as if another process completed the job in between.
    struct RacingMarkers {
        reads: AtomicUsize,
        completed_at: DateTime<Utc>,
    }

    impl RunMarkerStore for RacingMarkers {
        fn get_run_marker(&self, job_name: &str) -> anyhow::Result<Option<RunMarker>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(None);
            }
            Ok(Some(RunMarker {
                job_name: job_name.to_string(),
                last_run_at: Some(self.completed_at),
                last_completed_period: None,
            }))
        }

        fn upsert_run_marker(&self, _marker: &RunMarker) -> anyhow::Result<()> {
            panic!("must not persist after a failed re-check");
        }

        fn list_run_markers(&self) -> anyhow::Result<Vec<RunMarker>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_recheck_after_lock_skips_and_releases() {
        let markers = Arc::new(RacingMarkers {
            reads: AtomicUsize::new(0),
            completed_at: at(-1),
        });
        let mutex = Arc::new(CountingMutex::default());
        let coordinator = JobCoordinator::new(markers, mutex.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("tracking_refresh", Duration::from_secs(1800)),
            calls.clone(),
        );

        let report = coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::SkippedIneligible);
        assert_eq!(report.state, CoordinatorState::Released);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(mutex.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_body_keeps_marker_and_releases() {
        let f = fixture();
        let job = RegisteredJob::new(
            JobDescriptor::simple("external_sync", Duration::from_secs(900)),
            Arc::new(|_: &TaskContext| -> Result<TaskOutcome, TaskError> {
                Err(TaskError::Failed("upstream returned 503".to_string()))
            }),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Failed);
        assert_eq!(report.error.as_deref(), Some("upstream returned 503"));
        assert_eq!(f.markers.get_run_marker("external_sync").unwrap(), None);
        assert_eq!(f.mutex.releases.load(Ordering::SeqCst), 1);
        let runs = f.history.runs.lock().unwrap();
        assert_eq!(runs[0].status, JobRunStatus::Failed);
    }

    #[test]
    fn test_panicking_body_releases_lock() {
        let f = fixture();
        let job = RegisteredJob::new(
            JobDescriptor::simple("external_sync", Duration::from_secs(900)),
            Arc::new(|_: &TaskContext| -> Result<TaskOutcome, TaskError> {
                panic!("index out of bounds");
            }),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Failed);
        assert!(report.error.unwrap().contains("index out of bounds"));
        assert_eq!(f.mutex.acquires.load(Ordering::SeqCst), 1);
        assert_eq!(f.mutex.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_persist_failure_still_reports_execution() {
        let f = fixture();
        f.markers.fail_writes.store(true, Ordering::SeqCst);
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::simple("reminder_dispatch", Duration::from_secs(600)),
            calls.clone(),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Executed);
        assert!(report.error.is_some());
        assert_eq!(f.mutex.releases.load(Ordering::SeqCst), 1);
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_partial_catchup_advances_period_only() {
        let f = fixture();
        f.markers
            .upsert_run_marker(&RunMarker {
                job_name: "daily_report".to_string(),
                last_run_at: Some(at(-86_400 * 4)),
                last_completed_period: Some(day(4)),
            })
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_by_body = seen.clone();
        let job = RegisteredJob::new(
            JobDescriptor::period_based(
                "daily_report",
                Duration::from_secs(3600),
                PeriodGranularity::Day,
                3,
            ),
            Arc::new(
                move |ctx: &TaskContext| -> Result<TaskOutcome, TaskError> {
                    let period = ctx.period.unwrap();
                    seen_by_body.lock().unwrap().push(period);
                    if period == day(8) {
                        return Err(TaskError::Failed("report service down".to_string()));
                    }
                    Ok(TaskOutcome::default())
                },
            ),
        );

        // now is 2024-03-10, boundary is 2024-03-09
        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Failed);
        assert_eq!(*seen.lock().unwrap(), vec![day(7), day(8)]);
        assert_eq!(report.periods, Some((day(7), day(7))));
        let marker = f.markers.get_run_marker("daily_report").unwrap().unwrap();
        assert_eq!(marker.last_completed_period, Some(day(7)));
        assert_eq!(marker.last_run_at, Some(at(-86_400 * 4)));

        // The next request retries from the failed period.
        seen.lock().unwrap().clear();
        let report = f.coordinator.run(&job, at(10));
        assert_eq!(report.decision, Decision::Executed);
        assert_eq!(*seen.lock().unwrap(), vec![day(8), day(9)]);
        let marker = f.markers.get_run_marker("daily_report").unwrap().unwrap();
        assert_eq!(marker.last_completed_period, Some(day(9)));
        assert_eq!(marker.last_run_at, Some(at(10)));
    }

    #[test]
    fn test_up_to_date_period_job_only_closes_gate() {
        let f = fixture();
        f.markers
            .upsert_run_marker(&RunMarker {
                job_name: "daily_report".to_string(),
                last_run_at: Some(at(-7200)),
                last_completed_period: Some(day(9)),
            })
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let job = counting_job(
            JobDescriptor::period_based(
                "daily_report",
                Duration::from_secs(3600),
                PeriodGranularity::Day,
                7,
            ),
            calls.clone(),
        );

        let report = f.coordinator.run(&job, at(0));

        assert_eq!(report.decision, Decision::Executed);
        assert_eq!(report.periods, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let marker = f.markers.get_run_marker("daily_report").unwrap().unwrap();
        assert_eq!(marker.last_run_at, Some(at(0)));
        assert_eq!(marker.last_completed_period, Some(day(9)));
    }
}
