//! Task body that delegates the actual work to an HTTP endpoint.
//!
//! The scheduler decides *when* a job runs; the endpoint owned by the
//! application decides *what* it does. Each invocation is one POST:
//!
//! ```json
//! {"job": "daily_report", "period": "2024-03-09", "scheduled_at": "2024-03-10T12:00:00Z"}
//! ```
//!
//! Any 2xx response is a success. The response body may report item counts as
//! `{"processed": 12, "failed": 1}`; anything else counts as zero items.

use crate::background_jobs::job::{TaskBody, TaskContext, TaskError, TaskOutcome};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

#[derive(Debug, Serialize)]
struct TaskRequest<'a> {
    job: &'a str,
    period: Option<NaiveDate>,
    scheduled_at: DateTime<Utc>,
}

pub struct HttpTaskBody {
    client: Client,
    endpoint: String,
    runtime: Handle,
}

impl HttpTaskBody {
    /// Must be called from within a tokio runtime; requests are driven on it.
    pub fn new(endpoint: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            runtime: Handle::try_current()?,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let request = TaskRequest {
            job: &ctx.job_name,
            period: ctx.period,
            scheduled_at: ctx.scheduled_at,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::Failed(format!(
                "{} responded with status {}",
                self.endpoint, status
            )));
        }

        let body = response.bytes().await?;
        let outcome = serde_json::from_slice::<TaskOutcome>(&body).unwrap_or_default();
        debug!(
            job = %ctx.job_name,
            processed = outcome.processed,
            failed = outcome.failed,
            "Task endpoint responded"
        );
        Ok(outcome)
    }
}

impl TaskBody for HttpTaskBody {
    /// Blocks the calling thread; only call from a blocking context.
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        self.runtime.block_on(self.post(ctx))
    }
}
