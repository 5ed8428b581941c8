//! Reusable task bodies.

pub mod batch;
pub mod http_task;

pub use batch::{run_batch, BatchSource, BatchTaskBody};
pub use http_task::HttpTaskBody;
