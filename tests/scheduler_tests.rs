//! Coordination scenarios against a real SQLite database.
//!
//! Several `SqliteSchedulerStore` instances opened on the same file stand in
//! for several server processes sharing one datastore.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tickgate::background_jobs::{
    Decision, JobCoordinator, JobDescriptor, PeriodGranularity, RegisteredJob, TaskContext,
    TaskError, TaskOutcome,
};
use tickgate::scheduler_store::{
    DistributedMutex, RunHistoryStore, RunMarker, RunMarkerStore, SqliteSchedulerStore,
};

const LOCK_TTL: Duration = Duration::from_secs(3600);

struct TestDb {
    dir: TempDir,
}

impl TestDb {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    /// A new connection to the shared database, as another process would open.
    fn open(&self) -> Arc<SqliteSchedulerStore> {
        self.open_with_ttl(LOCK_TTL)
    }

    fn open_with_ttl(&self, lock_ttl: Duration) -> Arc<SqliteSchedulerStore> {
        Arc::new(
            SqliteSchedulerStore::new(
                self.dir.path().join("scheduler.db"),
                lock_ttl,
                Duration::from_secs(2),
            )
            .unwrap(),
        )
    }
}

fn coordinator(store: &Arc<SqliteSchedulerStore>) -> JobCoordinator {
    JobCoordinator::new(store.clone(), store.clone()).with_history(store.clone(), 100)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap()
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn counting_job(name: &str, interval_secs: u64, calls: Arc<AtomicUsize>) -> RegisteredJob {
    RegisteredJob::new(
        JobDescriptor::simple(name, Duration::from_secs(interval_secs)),
        Arc::new(move |_: &TaskContext| -> Result<TaskOutcome, TaskError> {
            calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(TaskOutcome {
                processed: 1,
                failed: 0,
            })
        }),
    )
}

#[test]
fn test_concurrent_processes_execute_once() {
    let db = TestDb::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let job = counting_job("reminder_dispatch", 600, calls.clone());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = db.open();
            let job = job.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let coordinator = coordinator(&store);
                barrier.wait();
                coordinator.run(&job, t0()).decision
            })
        })
        .collect();
    let decisions: Vec<Decision> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        decisions
            .iter()
            .filter(|d| **d == Decision::Executed)
            .count(),
        1
    );
    assert!(decisions.iter().all(|d| matches!(
        d,
        Decision::Executed | Decision::SkippedLocked | Decision::SkippedIneligible
    )));
}

#[test]
fn test_processes_starting_together_on_a_fresh_database() {
    for _ in 0..10 {
        let db = TestDb::new();
        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let path = db.dir.path().join("scheduler.db");
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    SqliteSchedulerStore::new(path, LOCK_TTL, Duration::from_secs(2))
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        assert!(db.open().list_run_markers().unwrap().is_empty());
    }
}

#[test]
fn test_interval_scenario_across_processes() {
    let db = TestDb::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let job = counting_job("reminder_dispatch", 600, calls.clone());
    let process_a = coordinator(&db.open());
    let process_b = coordinator(&db.open());

    // never run: executes
    assert_eq!(process_a.run(&job, t0()).decision, Decision::Executed);
    // 10s later on another process: not due
    let report = process_b.run(&job, t0() + ChronoDuration::seconds(10));
    assert_eq!(report.decision, Decision::SkippedIneligible);
    // 700s after the first run: due again
    assert_eq!(
        process_b
            .run(&job, t0() + ChronoDuration::seconds(700))
            .decision,
        Decision::Executed
    );

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let marker = db.open().get_run_marker("reminder_dispatch").unwrap().unwrap();
    assert_eq!(marker.last_run_at, Some(t0() + ChronoDuration::seconds(700)));
}

#[test]
fn test_held_lock_skips_until_released() {
    let db = TestDb::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let job = counting_job("external_sync", 900, calls.clone());
    let other_process = db.open();
    let store = db.open();

    let lease = other_process
        .try_acquire(job.descriptor.mutex_name())
        .unwrap()
        .unwrap();
    let report = coordinator(&store).run(&job, t0());
    assert_eq!(report.decision, Decision::SkippedLocked);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.get_run_marker("external_sync").unwrap(), None);

    other_process.release(lease).unwrap();
    let report = coordinator(&store).run(&job, t0());
    assert_eq!(report.decision, Decision::Executed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_crashed_holder_lease_expires() {
    let db = TestDb::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let job = counting_job("tracking_refresh", 1800, calls.clone());

    // A process that acquired and died without releasing.
    let crashed = db.open_with_ttl(Duration::ZERO);
    let abandoned = crashed.try_acquire(job.descriptor.mutex_name()).unwrap();
    assert!(abandoned.is_some());
    thread::sleep(Duration::from_millis(5));

    let report = coordinator(&db.open()).run(&job, t0());
    assert_eq!(report.decision, Decision::Executed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_lock_released_after_failure_and_panic() {
    let db = TestDb::new();
    let store = db.open();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_in_body = attempts.clone();
    let job = RegisteredJob::new(
        JobDescriptor::simple("external_sync", Duration::from_secs(900)),
        Arc::new(move |_: &TaskContext| -> Result<TaskOutcome, TaskError> {
            match attempts_in_body.fetch_add(1, Ordering::SeqCst) {
                0 => Err(TaskError::Failed("upstream returned 502".to_string())),
                1 => panic!("unexpected payload"),
                _ => Ok(TaskOutcome::default()),
            }
        }),
    );
    let coordinator = coordinator(&store);

    let first = coordinator.run(&job, t0());
    assert_eq!(first.decision, Decision::Failed);
    let lease = store.try_acquire(job.descriptor.mutex_name()).unwrap();
    assert!(lease.is_some(), "lock must be free after a failing body");
    store.release(lease.unwrap()).unwrap();

    let second = coordinator.run(&job, t0() + ChronoDuration::seconds(1));
    assert_eq!(second.decision, Decision::Failed);
    assert!(second.error.unwrap().contains("unexpected payload"));
    let lease = store.try_acquire(job.descriptor.mutex_name()).unwrap();
    assert!(lease.is_some(), "lock must be free after a panicking body");
    store.release(lease.unwrap()).unwrap();

    // Failures never advanced the marker, so the job is retried right away.
    assert_eq!(store.get_run_marker("external_sync").unwrap(), None);
    let third = coordinator.run(&job, t0() + ChronoDuration::seconds(2));
    assert_eq!(third.decision, Decision::Executed);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let history = store.get_job_history("external_sync", 10).unwrap();
    let statuses: Vec<_> = history.iter().map(|r| r.status.as_str()).collect();
    assert_eq!(statuses, vec!["executed", "failed", "failed"]);
}

fn daily_report(seen: Arc<Mutex<Vec<NaiveDate>>>, fail_on: Option<NaiveDate>) -> RegisteredJob {
    RegisteredJob::new(
        JobDescriptor::period_based(
            "daily_report",
            Duration::from_secs(3600),
            PeriodGranularity::Day,
            3,
        ),
        Arc::new(move |ctx: &TaskContext| -> Result<TaskOutcome, TaskError> {
            let period = ctx
                .period
                .ok_or_else(|| TaskError::Failed("missing period".to_string()))?;
            seen.lock().unwrap().push(period);
            if Some(period) == fail_on {
                return Err(TaskError::Failed(format!("report for {} failed", period)));
            }
            Ok(TaskOutcome {
                processed: 10,
                failed: 0,
            })
        }),
    )
}

fn seed_daily_report(store: &SqliteSchedulerStore, last_completed: NaiveDate) {
    store
        .upsert_run_marker(&RunMarker {
            job_name: "daily_report".to_string(),
            last_run_at: Some(t0() - ChronoDuration::days(5)),
            last_completed_period: Some(last_completed),
        })
        .unwrap();
}

#[test]
fn test_catchup_is_bounded_by_lookback() {
    let db = TestDb::new();
    let store = db.open();
    // today is the 10th: last completed D-5, boundary D-1
    seed_daily_report(&store, day(5));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let report = coordinator(&store).run(&daily_report(seen.clone(), None), t0());

    assert_eq!(report.decision, Decision::Executed);
    assert_eq!(*seen.lock().unwrap(), vec![day(7), day(8), day(9)]);
    assert_eq!(report.processed, 30);
    assert_eq!(report.periods, Some((day(7), day(9))));
    let marker = store.get_run_marker("daily_report").unwrap().unwrap();
    assert_eq!(marker.last_completed_period, Some(day(9)));
    assert_eq!(marker.last_run_at, Some(t0()));

    let history = store.get_job_history("daily_report", 1).unwrap();
    assert_eq!(history[0].first_period, Some(day(7)));
    assert_eq!(history[0].last_period, Some(day(9)));
}

#[test]
fn test_catchup_failure_keeps_contiguous_progress() {
    let db = TestDb::new();
    let store = db.open();
    seed_daily_report(&store, day(5));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let report = coordinator(&store).run(&daily_report(seen.clone(), Some(day(8))), t0());

    assert_eq!(report.decision, Decision::Failed);
    assert_eq!(*seen.lock().unwrap(), vec![day(7), day(8)]);
    let marker = store.get_run_marker("daily_report").unwrap().unwrap();
    assert_eq!(marker.last_completed_period, Some(day(7)));
    assert_eq!(marker.last_run_at, Some(t0() - ChronoDuration::days(5)));

    // A later request on another process resumes at the failed period.
    seen.lock().unwrap().clear();
    let other = db.open();
    let report = coordinator(&other).run(
        &daily_report(seen.clone(), None),
        t0() + ChronoDuration::seconds(30),
    );
    assert_eq!(report.decision, Decision::Executed);
    assert_eq!(*seen.lock().unwrap(), vec![day(8), day(9)]);
}

#[test]
fn test_first_period_run_only_does_latest_period() {
    let db = TestDb::new();
    let store = db.open();
    let seen = Arc::new(Mutex::new(Vec::new()));

    coordinator(&store).run(&daily_report(seen.clone(), None), t0());

    assert_eq!(*seen.lock().unwrap(), vec![day(9)]);
}
