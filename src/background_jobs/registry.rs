use super::coordinator::{InvocationReport, JobCoordinator};
use super::job::{JobDescriptor, TaskBody};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::info;

/// A descriptor paired with the body that does the work.
#[derive(Clone)]
pub struct RegisteredJob {
    pub descriptor: JobDescriptor,
    pub body: Arc<dyn TaskBody>,
}

impl RegisteredJob {
    pub fn new(descriptor: JobDescriptor, body: Arc<dyn TaskBody>) -> Self {
        Self { descriptor, body }
    }
}

impl std::fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Jobs already attempted while serving one request.
///
/// Shared through the request extensions so that a hook installed twice, or
/// called again by a handler, attempts each job at most once per request.
#[derive(Debug, Default)]
pub struct RequestAttempts {
    attempted: Mutex<HashSet<String>>,
}

impl RequestAttempts {
    /// True the first time `job_name` is seen.
    pub fn first_attempt(&self, job_name: &str) -> bool {
        match self.attempted.lock() {
            Ok(mut attempted) => attempted.insert(job_name.to_string()),
            Err(_) => false,
        }
    }
}

/// Jobs currently executing somewhere in this process.
///
/// A local fast path in front of the distributed mutex: concurrent requests
/// in the same process skip a job without a datastore round trip.
#[derive(Debug, Default)]
pub struct InFlightJobs {
    running: Mutex<HashSet<String>>,
}

impl InFlightJobs {
    pub fn try_enter(&self, job_name: &str) -> Option<InFlightGuard<'_>> {
        let mut running = self.running.lock().ok()?;
        if !running.insert(job_name.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            jobs: self,
            job_name: job_name.to_string(),
        })
    }

    pub fn is_in_flight(&self, job_name: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains(job_name))
            .unwrap_or(false)
    }
}

pub struct InFlightGuard<'a> {
    jobs: &'a InFlightJobs,
    job_name: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.jobs.running.lock() {
            running.remove(&self.job_name);
        }
    }
}

/// Ordered set of registered jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Vec<RegisteredJob>,
    in_flight: InFlightJobs,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: JobDescriptor, body: Arc<dyn TaskBody>) -> Result<()> {
        if self.get(descriptor.name()).is_some() {
            bail!("Job {} is already registered", descriptor.name());
        }
        info!(
            job = descriptor.name(),
            interval_secs = descriptor.interval().as_secs(),
            kind = ?descriptor.kind(),
            enabled = descriptor.is_enabled(),
            "Registering job"
        );
        self.jobs.push(RegisteredJob::new(descriptor, body));
        Ok(())
    }

    pub fn get(&self, job_name: &str) -> Option<&RegisteredJob> {
        self.jobs.iter().find(|job| job.descriptor.name() == job_name)
    }

    /// Jobs in registration order.
    pub fn jobs(&self) -> &[RegisteredJob] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn in_flight(&self) -> &InFlightJobs {
        &self.in_flight
    }

    /// Give every enabled job one chance to run, sequentially, in
    /// registration order. One job's failure does not stop the others.
    ///
    /// `clock` is read right before each job, so a slow job does not hand
    /// a stale instant to the jobs after it.
    pub fn run_due<C>(
        &self,
        coordinator: &JobCoordinator,
        attempts: &RequestAttempts,
        clock: C,
    ) -> Vec<InvocationReport>
    where
        C: Fn() -> DateTime<Utc>,
    {
        let mut reports = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let name = job.descriptor.name();
            if !job.descriptor.is_enabled() || !attempts.first_attempt(name) {
                continue;
            }
            let Some(_guard) = self.in_flight.try_enter(name) else {
                reports.push(coordinator.skip_in_flight(job));
                continue;
            };
            reports.push(coordinator.run(job, clock()));
        }
        reports
    }
}
