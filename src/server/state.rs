use axum::extract::FromRef;

use crate::background_jobs::JobScheduler;
use std::sync::Arc;
use std::time::Instant;

pub type GuardedJobScheduler = Arc<JobScheduler>;

#[derive(Clone)]
pub struct ServerState {
    pub start_time: Instant,
    pub scheduler: GuardedJobScheduler,
}

impl ServerState {
    pub fn new(scheduler: GuardedJobScheduler) -> Self {
        Self {
            start_time: Instant::now(),
            scheduler,
        }
    }
}

impl FromRef<ServerState> for GuardedJobScheduler {
    fn from_ref(input: &ServerState) -> Self {
        input.scheduler.clone()
    }
}
