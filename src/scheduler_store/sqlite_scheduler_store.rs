use super::models::{JobRun, JobRunStatus, LockLease, NewJobRun, RunMarker};
use super::schema::SCHEDULER_VERSIONED_SCHEMAS;
use super::{DistributedMutex, RunHistoryStore, RunMarkerStore};
use crate::sqlite_persistence::prepare_database;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const PERIOD_FORMAT: &str = "%Y-%m-%d";

/// SQLite-backed run markers, lock leases and history.
///
/// Every process opening the same database file shares the same locks. A
/// lease nobody released (crashed process) becomes free again once
/// `lock_ttl` has elapsed.
pub struct SqliteSchedulerStore {
    conn: Arc<Mutex<Connection>>,
    lock_ttl: Duration,
    holder_prefix: String,
}

impl SqliteSchedulerStore {
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        lock_ttl: Duration,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = db_path.as_ref();
        info!("Opening scheduler database at {:?}", path);

        let mut conn = Connection::open(path).context("Failed to open scheduler database")?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        debug!("Scheduler database journal mode: {}", journal_mode);

        prepare_database(&mut conn, SCHEDULER_VERSIONED_SCHEMAS, "scheduler")?;

        // Applied after schema preparation so start-up migrations may wait
        // for other processes; from here on contention fails fast.
        conn.busy_timeout(busy_timeout)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            lock_ttl,
            holder_prefix: format!("pid-{}", std::process::id()),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Scheduler database connection mutex poisoned"))
    }

    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339()
    }

    fn format_period(period: &NaiveDate) -> String {
        period.format(PERIOD_FORMAT).to_string()
    }

    fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn parse_period(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
        NaiveDate::parse_from_str(s, PERIOD_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }

    fn optional_datetime(
        row: &rusqlite::Row,
        idx: usize,
    ) -> rusqlite::Result<Option<DateTime<Utc>>> {
        row.get::<_, Option<String>>(idx)?
            .map(|s| Self::parse_datetime(idx, &s))
            .transpose()
    }

    fn optional_period(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
        row.get::<_, Option<String>>(idx)?
            .map(|s| Self::parse_period(idx, &s))
            .transpose()
    }

    fn row_to_run_marker(row: &rusqlite::Row) -> rusqlite::Result<RunMarker> {
        Ok(RunMarker {
            job_name: row.get(0)?,
            last_run_at: Self::optional_datetime(row, 1)?,
            last_completed_period: Self::optional_period(row, 2)?,
        })
    }

    fn row_to_job_run(row: &rusqlite::Row) -> rusqlite::Result<JobRun> {
        let status_str: String = row.get(4)?;
        let status = JobRunStatus::parse(&status_str).unwrap_or(JobRunStatus::Failed);
        let started_at: String = row.get(2)?;
        let finished_at: String = row.get(3)?;
        let processed: i64 = row.get(5)?;
        let failed_items: i64 = row.get(6)?;

        Ok(JobRun {
            id: row.get(0)?,
            job_name: row.get(1)?,
            started_at: Self::parse_datetime(2, &started_at)?,
            finished_at: Self::parse_datetime(3, &finished_at)?,
            status,
            processed: processed.max(0) as u64,
            failed_items: failed_items.max(0) as u64,
            first_period: Self::optional_period(row, 7)?,
            last_period: Self::optional_period(row, 8)?,
            error: row.get(9)?,
        })
    }
}

impl RunMarkerStore for SqliteSchedulerStore {
    fn get_run_marker(&self, job_name: &str) -> Result<Option<RunMarker>> {
        let conn = self.conn()?;
        let marker = conn
            .query_row(
                "SELECT job_name, last_run_at, last_completed_period
                 FROM run_markers WHERE job_name = ?1",
                params![job_name],
                Self::row_to_run_marker,
            )
            .optional()
            .with_context(|| format!("Failed to read run marker for {}", job_name))?;
        Ok(marker)
    }

    fn upsert_run_marker(&self, marker: &RunMarker) -> Result<()> {
        let conn = self.conn()?;
        let now = Self::format_datetime(&Utc::now());
        let last_run_at = marker.last_run_at.as_ref().map(Self::format_datetime);
        let last_completed_period = marker.last_completed_period.as_ref().map(Self::format_period);

        conn.execute(
            "INSERT INTO run_markers (job_name, last_run_at, last_completed_period, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_name) DO UPDATE SET
                last_run_at = ?2, last_completed_period = ?3, updated_at = ?4",
            params![marker.job_name, last_run_at, last_completed_period, now],
        )
        .with_context(|| format!("Failed to upsert run marker for {}", marker.job_name))?;
        Ok(())
    }

    fn list_run_markers(&self) -> Result<Vec<RunMarker>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT job_name, last_run_at, last_completed_period
             FROM run_markers ORDER BY job_name",
        )?;
        let markers = stmt
            .query_map([], Self::row_to_run_marker)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(markers)
    }
}

impl DistributedMutex for SqliteSchedulerStore {
    fn try_acquire(&self, name: &str) -> Result<Option<LockLease>> {
        let conn = self.conn()?;
        let acquired_at = Utc::now();
        let expires_at = acquired_at
            + chrono::Duration::from_std(self.lock_ttl).unwrap_or(chrono::Duration::hours(1));
        let holder = format!("{}-{}", self.holder_prefix, uuid::Uuid::new_v4());

        // Single statement: inserts a fresh row, or takes over a row whose
        // lease has expired. A live lease leaves the row untouched.
        let changed = conn
            .execute(
                "INSERT INTO scheduler_locks (name, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    holder = excluded.holder,
                    acquired_at = excluded.acquired_at,
                    expires_at = excluded.expires_at
                 WHERE scheduler_locks.expires_at <= ?5",
                params![
                    name,
                    holder,
                    Self::format_datetime(&acquired_at),
                    expires_at.timestamp_millis(),
                    acquired_at.timestamp_millis()
                ],
            )
            .with_context(|| format!("Failed to acquire lock {}", name))?;

        if changed == 0 {
            return Ok(None);
        }

        Ok(Some(LockLease {
            name: name.to_string(),
            holder,
            acquired_at,
            expires_at,
        }))
    }

    fn release(&self, lease: LockLease) -> Result<()> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM scheduler_locks WHERE name = ?1 AND holder = ?2",
                params![lease.name, lease.holder],
            )
            .with_context(|| format!("Failed to release lock {}", lease.name))?;

        if deleted == 0 {
            anyhow::bail!(
                "Lock {} was no longer held by {} (lease expired at {})",
                lease.name,
                lease.holder,
                lease.expires_at
            );
        }
        Ok(())
    }
}

impl RunHistoryStore for SqliteSchedulerStore {
    fn record_run(&self, run: &NewJobRun) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_runs (job_name, started_at, finished_at, status, processed,
                                   failed_items, first_period, last_period, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.job_name,
                Self::format_datetime(&run.started_at),
                Self::format_datetime(&run.finished_at),
                run.status.as_str(),
                run.processed as i64,
                run.failed_items as i64,
                run.first_period.as_ref().map(Self::format_period),
                run.last_period.as_ref().map(Self::format_period),
                run.error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_job_history(&self, job_name: &str, limit: usize) -> Result<Vec<JobRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_name, started_at, finished_at, status, processed, failed_items,
                    first_period, last_period, error
             FROM job_runs WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let runs = stmt
            .query_map(params![job_name, limit as i64], Self::row_to_job_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    fn prune_job_history(&self, job_name: &str, keep: usize) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM job_runs WHERE job_name = ?1 AND id NOT IN (
                SELECT id FROM job_runs WHERE job_name = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![job_name, keep as i64],
        )?;
        Ok(deleted)
    }
}
