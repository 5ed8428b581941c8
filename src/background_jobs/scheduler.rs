use super::coordinator::{InvocationReport, JobCoordinator};
use super::gate::IntervalGate;
use super::job::JobKind;
use super::registry::{JobRegistry, RequestAttempts};
use crate::scheduler_store::{
    DistributedMutex, JobRun, RunHistoryStore, RunMarker, RunMarkerStore,
};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

/// How the request hook waits for due jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// The triggering request waits for the jobs before being handled.
    #[default]
    Inline,
    /// Jobs run on the blocking pool; the request proceeds immediately.
    Detached,
}

/// Information about a registered job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    pub interval_secs: u64,
    pub enabled: bool,
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_completed_period: Option<NaiveDate>,
    pub next_due_at: Option<DateTime<Utc>>,
}

/// Piggybacks registered jobs on incoming requests.
pub struct JobScheduler {
    registry: JobRegistry,
    coordinator: JobCoordinator,
    markers: Arc<dyn RunMarkerStore>,
    history: Option<Arc<dyn RunHistoryStore>>,
    dispatch: DispatchMode,
}

impl JobScheduler {
    pub fn new(
        registry: JobRegistry,
        markers: Arc<dyn RunMarkerStore>,
        mutex: Arc<dyn DistributedMutex>,
        dispatch: DispatchMode,
    ) -> Self {
        Self {
            registry,
            coordinator: JobCoordinator::new(markers.clone(), mutex),
            markers,
            history: None,
            dispatch,
        }
    }

    pub fn with_history(mut self, history: Arc<dyn RunHistoryStore>, retention: usize) -> Self {
        self.coordinator = self.coordinator.with_history(history.clone(), retention);
        self.history = Some(history);
        self
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn dispatch(&self) -> DispatchMode {
        self.dispatch
    }

    /// Synchronous pass over every registered job. Blocks on datastore I/O
    /// and on task bodies.
    pub fn run_due_jobs<C>(&self, attempts: &RequestAttempts, clock: C) -> Vec<InvocationReport>
    where
        C: Fn() -> DateTime<Utc>,
    {
        self.registry.run_due(&self.coordinator, attempts, clock)
    }

    /// Called once per request by the hook. Never fails: problems end up in
    /// the reports and in the logs.
    pub async fn on_request(
        self: &Arc<Self>,
        attempts: Arc<RequestAttempts>,
    ) -> Vec<InvocationReport> {
        if self.registry.is_empty() {
            return Vec::new();
        }
        let scheduler = Arc::clone(self);
        let task = tokio::task::spawn_blocking(move || {
            scheduler.run_due_jobs(&attempts, Utc::now)
        });
        match self.dispatch {
            DispatchMode::Inline => match task.await {
                Ok(reports) => reports,
                Err(e) => {
                    error!("Scheduler pass panicked: {}", e);
                    Vec::new()
                }
            },
            DispatchMode::Detached => Vec::new(),
        }
    }

    pub fn list_jobs(&self) -> Result<Vec<JobInfo>> {
        let markers: HashMap<String, RunMarker> = self
            .markers
            .list_run_markers()?
            .into_iter()
            .map(|marker| (marker.job_name.clone(), marker))
            .collect();

        let in_flight = self.registry.in_flight();
        Ok(self
            .registry
            .jobs()
            .iter()
            .map(|job| {
                let descriptor = &job.descriptor;
                let marker = markers.get(descriptor.name());
                let last_run_at = marker.and_then(|m| m.last_run_at);
                let (kind, granularity) = match descriptor.kind() {
                    JobKind::Simple => ("simple", None),
                    JobKind::PeriodBased { granularity, .. } => {
                        ("period_based", Some(granularity.to_string()))
                    }
                };
                JobInfo {
                    name: descriptor.name().to_string(),
                    kind: kind.to_string(),
                    granularity,
                    interval_secs: descriptor.interval().as_secs(),
                    enabled: descriptor.is_enabled(),
                    is_running: in_flight.is_in_flight(descriptor.name()),
                    last_run_at,
                    last_completed_period: marker.and_then(|m| m.last_completed_period),
                    next_due_at: IntervalGate::new(descriptor.interval()).next_due(last_run_at),
                }
            })
            .collect())
    }

    /// `None` for an unknown job.
    pub fn job_history(&self, job_name: &str, limit: usize) -> Result<Option<Vec<JobRun>>> {
        if self.registry.get(job_name).is_none() {
            return Ok(None);
        }
        match &self.history {
            Some(history) => Ok(Some(history.get_job_history(job_name, limit)?)),
            None => Ok(Some(Vec::new())),
        }
    }
}
