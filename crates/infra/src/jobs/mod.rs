//! Background migration jobs: queue, scheduling, execution, draining.
//!
//! ## Flow
//!
//! - [`Scheduler`] enqueues `(name, args[, delay])` into a [`JobQueue`]
//! - [`MigrationWorker`] claims jobs, resolves the unit by name through the
//!   registry, performs it, then acknowledges, requeues with backoff, or
//!   dead-letters
//! - [`CompletionTracker`] reports what is still outstanding per name
//! - [`DrainController`] claims and executes a name's remaining jobs
//!   synchronously until none are left
//!
//! Delivery is at-least-once: a claim holds a lease, and a job whose lease
//! expires before it is acknowledged is handed out again.

pub mod drain;
pub mod executor;
pub mod postgres;
pub mod scheduler;
pub mod sink;
pub mod store;
pub mod tracker;
pub mod types;

pub use drain::{DelayPolicy, DrainConfig, DrainController, DrainError, DrainReport};
pub use executor::{MigrationWorker, WorkerConfig, WorkerHandle, WorkerStats};
pub use postgres::PostgresJobQueue;
pub use scheduler::{record_payloads, Scheduler};
pub use sink::{CountingFailureSink, FailureSink, TracingFailureSink};
pub use store::{InMemoryJobQueue, JobQueue, QueueError};
pub use tracker::CompletionTracker;
pub use types::{
    BackoffStrategy, ClaimFilter, DeadLetterEntry, JobState, MigrationRun, RetryPolicy, RunOutcome,
    ScheduledJob,
};
