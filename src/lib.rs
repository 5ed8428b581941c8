//! Tickgate: request-driven scheduling of recurring jobs.
//!
//! This library exposes the internal modules for the server binary and for
//! embedding the scheduler in another axum application.

pub mod background_jobs;
pub mod config;
pub mod scheduler_store;
pub mod server;
pub mod sqlite_persistence;

// Re-export commonly used types for convenience
pub use background_jobs::{JobDescriptor, JobRegistry, JobScheduler, TaskBody};
pub use scheduler_store::SqliteSchedulerStore;
pub use server::{make_app, run_server, scheduler_hook};
