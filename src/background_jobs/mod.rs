//! Opportunistic background job scheduling.
//!
//! There is no timer thread. Each incoming request gives every registered job
//! a chance to run; a job actually runs when its interval has elapsed since
//! its last success and no other process currently holds its lock.

pub mod catchup;
mod coordinator;
mod gate;
mod job;
pub mod jobs;
mod registry;
mod scheduler;

pub use catchup::{CatchupPlan, CatchupResult};
pub use coordinator::{CoordinatorState, Decision, InvocationReport, JobCoordinator};
pub use gate::IntervalGate;
pub use job::{
    JobDescriptor, JobKind, PeriodGranularity, TaskBody, TaskContext, TaskError, TaskOutcome,
    MIN_JOB_INTERVAL,
};
pub use registry::{InFlightGuard, InFlightJobs, JobRegistry, RegisteredJob, RequestAttempts};
pub use scheduler::{DispatchMode, JobInfo, JobScheduler};
