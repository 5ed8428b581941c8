mod file_config;

pub use file_config::{FileConfig, JobConfig, SchedulerConfig};

use crate::background_jobs::{DispatchMode, JobDescriptor, JobKind, PeriodGranularity};
use anyhow::{anyhow, bail, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const SCHEDULER_DB_FILE: &str = "scheduler.db";

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// A lease not released within this time is free for anyone to take.
    pub lock_ttl: Duration,
    /// How long a datastore call waits on contention before failing.
    pub store_busy_timeout: Duration,
    pub dispatch: DispatchMode,
    /// History rows kept per job; 0 keeps everything.
    pub history_retention: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(7 * 24 * 3600),
            lock_ttl: Duration::from_secs(3600),
            store_busy_timeout: Duration::from_millis(50),
            dispatch: DispatchMode::Inline,
            history_retention: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSettings {
    pub descriptor: JobDescriptor,
    /// Where the task body lives. Jobs without one are not registered.
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub metrics_port: u16,
    pub scheduler: SchedulerSettings,
    /// Built-in jobs first, in their fixed order, then the others by name.
    pub jobs: Vec<JobSettings>,
}

const DEFAULT_LOOKBACK_PERIODS: u32 = 7;
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_JOB_INTERVAL_SECS: u64 = 3600;
/// Slack between the longest possible invocation and the lock lease.
const LOCK_TTL_MARGIN: Duration = Duration::from_secs(60);

/// Jobs known out of the box: (name, interval secs, period granularity).
const BUILTIN_JOBS: &[(&str, u64, Option<PeriodGranularity>)] = &[
    ("reminder_dispatch", 600, None),
    ("daily_report", 3600, Some(PeriodGranularity::Day)),
    ("tracking_refresh", 1800, None),
    ("external_sync", 900, None),
];

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| anyhow!("db_dir must be specified via --db-dir or in config file"))?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);
        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        let scheduler = resolve_scheduler(file.scheduler.unwrap_or_default())?;

        let mut job_files = file.jobs;
        let mut jobs = Vec::new();
        for (name, interval_secs, granularity) in BUILTIN_JOBS {
            let job_file = job_files.remove(*name).unwrap_or_default();
            let defaults = JobConfig {
                interval_secs: Some(*interval_secs),
                kind: Some(
                    if granularity.is_some() {
                        "period_based"
                    } else {
                        "simple"
                    }
                    .to_string(),
                ),
                granularity: granularity.map(|g| g.as_str().to_string()),
                ..Default::default()
            };
            jobs.push(resolve_job(name, job_file, defaults, &scheduler)?);
        }
        for (name, job_file) in job_files {
            jobs.push(resolve_job(&name, job_file, JobConfig::default(), &scheduler)?);
        }
        check_lock_ttl(&scheduler, &jobs)?;

        Ok(Self {
            db_dir,
            port,
            metrics_port,
            scheduler,
            jobs,
        })
    }

    pub fn scheduler_db_path(&self) -> PathBuf {
        self.db_dir.join(SCHEDULER_DB_FILE)
    }
}

fn resolve_scheduler(file: SchedulerConfig) -> Result<SchedulerSettings> {
    let defaults = SchedulerSettings::default();

    let min_interval = file
        .min_interval_secs
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(defaults.min_interval);
    let max_interval = file
        .max_interval_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.max_interval);
    if min_interval > max_interval {
        bail!(
            "scheduler.min_interval_secs ({}) exceeds scheduler.max_interval_secs ({})",
            min_interval.as_secs(),
            max_interval.as_secs()
        );
    }

    let dispatch = match file.dispatch.as_deref().map(str::to_lowercase).as_deref() {
        None => defaults.dispatch,
        Some("inline") => DispatchMode::Inline,
        Some("detached") => DispatchMode::Detached,
        Some(other) => bail!("Unknown scheduler.dispatch value: {}", other),
    };

    let lock_ttl = file
        .lock_ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(defaults.lock_ttl);
    if lock_ttl.is_zero() {
        bail!("scheduler.lock_ttl_secs must be greater than 0");
    }

    Ok(SchedulerSettings {
        min_interval,
        max_interval,
        lock_ttl,
        store_busy_timeout: file
            .store_busy_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_busy_timeout),
        dispatch,
        history_retention: file.history_retention.unwrap_or(defaults.history_retention),
    })
}

fn resolve_job(
    name: &str,
    file: JobConfig,
    defaults: JobConfig,
    scheduler: &SchedulerSettings,
) -> Result<JobSettings> {
    let interval_secs = file
        .interval_secs
        .or(defaults.interval_secs)
        .unwrap_or(DEFAULT_JOB_INTERVAL_SECS);
    let interval = clamp_interval(name, Duration::from_secs(interval_secs), scheduler);

    let kind = file
        .kind
        .or(defaults.kind)
        .unwrap_or_else(|| "simple".to_string());
    let descriptor = match kind.as_str() {
        "simple" => JobDescriptor::simple(name, interval),
        "period_based" => {
            let granularity_name = file
                .granularity
                .or(defaults.granularity)
                .unwrap_or_else(|| "day".to_string());
            let granularity = PeriodGranularity::parse(&granularity_name).ok_or_else(|| {
                anyhow!("Unknown granularity for job {}: {}", name, granularity_name)
            })?;
            let lookback = file
                .max_lookback_periods
                .unwrap_or(DEFAULT_LOOKBACK_PERIODS);
            if lookback == 0 {
                warn!("Job {}: max_lookback_periods must be at least 1, using 1", name);
            }
            JobDescriptor::period_based(name, interval, granularity, lookback)
        }
        other => bail!("Unknown kind for job {}: {}", name, other),
    };

    Ok(JobSettings {
        descriptor: descriptor.with_enabled(file.enabled.unwrap_or(true)),
        endpoint: file.endpoint,
        timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TASK_TIMEOUT_SECS)),
    })
}

/// Upper bound of one invocation: a period-based job may call its body once
/// per period of its lookback window.
fn worst_case_invocation(job: &JobSettings) -> Duration {
    let calls = match job.descriptor.kind() {
        JobKind::Simple => 1,
        JobKind::PeriodBased {
            max_lookback_periods,
            ..
        } => max_lookback_periods,
    };
    job.timeout.saturating_mul(calls)
}

/// A lease must outlive any invocation holding it, otherwise another process
/// could take the lock over while the body is still running.
fn check_lock_ttl(scheduler: &SchedulerSettings, jobs: &[JobSettings]) -> Result<()> {
    for job in jobs.iter().filter(|j| j.descriptor.is_enabled()) {
        let required = worst_case_invocation(job).saturating_add(LOCK_TTL_MARGIN);
        if scheduler.lock_ttl < required {
            bail!(
                "scheduler.lock_ttl_secs ({}) is too short for job {}: it must be at least {}s",
                scheduler.lock_ttl.as_secs(),
                job.descriptor.name(),
                required.as_secs()
            );
        }
    }
    Ok(())
}

fn clamp_interval(name: &str, interval: Duration, scheduler: &SchedulerSettings) -> Duration {
    let clamped = interval.clamp(scheduler.min_interval, scheduler.max_interval);
    if clamped != interval {
        warn!(
            "Job {}: interval of {}s is out of range, using {}s",
            name,
            interval.as_secs(),
            clamped.as_secs()
        );
    }
    clamped
}
