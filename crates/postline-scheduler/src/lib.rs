//! Durable delayed-publish scheduler for Postline.
//!
//! This crate provides a persistent scheduler that:
//! - Stores jobs in SQLite so delays survive restarts
//! - Claims each due job exactly once, even across processes
//! - Invokes the job's webhook and retries failures with exponential backoff
//! - Keeps running, degraded, while the store is unreachable

mod config;
mod error;
mod executor;
mod health;
mod scheduler;
mod store;
mod supervisor;
mod types;

pub use config::{DEFAULT_QUEUE_NAME, SchedulerConfig, ServiceConfig};
pub use error::{CallbackError, SchedulerError};
pub use executor::{ExecutionOutcome, Executor, Publisher, WebhookPublisher};
pub use health::{
    ConnectionState, HealthReport, HealthStatus, QueueInfo, STORE_UNAVAILABLE_WARNING,
    StatusReporter,
};
pub use scheduler::Scheduler;
pub use store::{JobStore, StoreLocation};
pub use supervisor::StoreSupervisor;
pub use types::{Job, JobState, JobUpdate, NewJob, RetryPolicy};
