//! Bodies that work through a bounded batch of items per invocation.
//!
//! A failing item is counted and logged, it does not fail the invocation:
//! the item stays pending at its source and is picked up again on the next
//! run. Only failing to fetch the batch fails the invocation.

use crate::background_jobs::job::{TaskBody, TaskContext, TaskError, TaskOutcome};
use tracing::{info, warn};

/// Where a batch job gets its work from.
pub trait BatchSource: Send + Sync {
    type Item: std::fmt::Debug;

    /// At most `limit` pending items.
    fn fetch_pending(&self, ctx: &TaskContext, limit: usize) -> Result<Vec<Self::Item>, TaskError>;

    fn process(&self, ctx: &TaskContext, item: &Self::Item) -> Result<(), TaskError>;
}

pub struct BatchTaskBody<S: BatchSource> {
    source: S,
    batch_size: usize,
}

impl<S: BatchSource> BatchTaskBody<S> {
    pub fn new(source: S, batch_size: usize) -> Self {
        Self {
            source,
            batch_size: batch_size.max(1),
        }
    }
}

impl<S: BatchSource> TaskBody for BatchTaskBody<S> {
    fn execute(&self, ctx: &TaskContext) -> Result<TaskOutcome, TaskError> {
        let items = self.source.fetch_pending(ctx, self.batch_size)?;
        let outcome = run_batch(ctx, &items, |item| self.source.process(ctx, item));
        info!(
            job = %ctx.job_name,
            processed = outcome.processed,
            failed = outcome.failed,
            "Batch complete"
        );
        Ok(outcome)
    }
}

/// Apply `process` to every item, collecting per-item failures into counts.
pub fn run_batch<T, F>(ctx: &TaskContext, items: &[T], mut process: F) -> TaskOutcome
where
    T: std::fmt::Debug,
    F: FnMut(&T) -> Result<(), TaskError>,
{
    let mut outcome = TaskOutcome::default();
    for item in items {
        match process(item) {
            Ok(()) => outcome.processed += 1,
            Err(e) => {
                warn!(job = %ctx.job_name, ?item, "Item failed: {}", e);
                outcome.failed += 1;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Reminder {
        id: u32,
        recipient: &'static str,
    }

    /// Pending reminders; delivering to "bounce" always fails.
    struct Outbox {
        pending: Mutex<Vec<Reminder>>,
        fetch_fails: bool,
    }

    impl Outbox {
        fn with(reminders: Vec<Reminder>) -> Self {
            Self {
                pending: Mutex::new(reminders),
                fetch_fails: false,
            }
        }
    }

    impl BatchSource for Outbox {
        type Item = Reminder;

        fn fetch_pending(
            &self,
            _ctx: &TaskContext,
            limit: usize,
        ) -> Result<Vec<Reminder>, TaskError> {
            if self.fetch_fails {
                return Err(TaskError::Failed("outbox unavailable".to_string()));
            }
            Ok(self.pending.lock().unwrap().iter().take(limit).cloned().collect())
        }

        fn process(&self, _ctx: &TaskContext, item: &Reminder) -> Result<(), TaskError> {
            if item.recipient == "bounce" {
                return Err(TaskError::Failed(format!("mailbox rejected {}", item.id)));
            }
            self.pending.lock().unwrap().retain(|r| r.id != item.id);
            Ok(())
        }
    }

    fn ctx() -> TaskContext {
        TaskContext {
            job_name: "reminder_dispatch".to_string(),
            scheduled_at: Utc::now(),
            period: None,
        }
    }

    fn reminders() -> Vec<Reminder> {
        vec![
            Reminder { id: 1, recipient: "alice" },
            Reminder { id: 2, recipient: "bounce" },
            Reminder { id: 3, recipient: "carol" },
            Reminder { id: 4, recipient: "dave" },
        ]
    }

    #[test]
    fn test_item_failures_do_not_fail_the_batch() {
        let body = BatchTaskBody::new(Outbox::with(reminders()), 10);

        let outcome = body.execute(&ctx()).unwrap();

        assert_eq!(outcome, TaskOutcome { processed: 3, failed: 1 });
        let left = body.source.pending.lock().unwrap().clone();
        assert_eq!(left, vec![Reminder { id: 2, recipient: "bounce" }]);
    }

    #[test]
    fn test_batch_size_bounds_work_per_invocation() {
        let body = BatchTaskBody::new(Outbox::with(reminders()), 2);

        let outcome = body.execute(&ctx()).unwrap();
        assert_eq!(outcome, TaskOutcome { processed: 1, failed: 1 });
        assert_eq!(body.source.pending.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_fetch_failure_fails_invocation() {
        let mut outbox = Outbox::with(reminders());
        outbox.fetch_fails = true;
        let body = BatchTaskBody::new(outbox, 10);

        assert!(body.execute(&ctx()).is_err());
    }
}
