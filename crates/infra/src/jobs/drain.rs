//! Synchronous draining ("stealing") of a migration's outstanding jobs.
//!
//! Used by one-off operator tasks before destructive cleanup: once
//! [`DrainController::drain`] returns `Ok`, no job for that name is left in
//! the queue. Drains claim through the same atomic `claim_next` as the worker
//! pool, so any number of drainers and workers can run side by side without a
//! job being executed by two of them under the same lease.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use bgmigrate_core::MigrationName;

use super::executor::MigrationWorker;
use super::store::{JobQueue, QueueError};
use super::tracker::CompletionTracker;
use super::types::{ClaimFilter, RunOutcome};

/// How a drain treats jobs whose `not_before` lies in the future.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayPolicy {
    /// Wait until delayed jobs (and retry backoffs) become eligible.
    #[default]
    Wait,
    /// Treat every pending job as eligible right away.
    Immediate,
}

#[derive(Debug, Clone)]
pub struct DrainConfig {
    /// Sleep between checks while the remaining jobs are delayed or claimed
    /// elsewhere.
    pub poll_interval: Duration,
    pub delay_policy: DelayPolicy,
    /// Give up after this long. `None` blocks until the queue is empty.
    pub deadline: Option<Duration>,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            delay_policy: DelayPolicy::Wait,
            deadline: None,
        }
    }
}

impl DrainConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_delay_policy(mut self, delay_policy: DelayPolicy) -> Self {
        self.delay_policy = delay_policy;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// What one drain call executed itself (jobs finished by other drainers or
/// workers meanwhile are not counted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub executed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// Runs whose outcome was dropped because the job had been re-claimed.
    pub superseded: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: &RunOutcome) {
        self.executed += 1;
        match outcome {
            RunOutcome::Succeeded => self.succeeded += 1,
            RunOutcome::Retrying { .. } => self.retried += 1,
            RunOutcome::DeadLettered { .. } => self.dead_lettered += 1,
            RunOutcome::Superseded => self.superseded += 1,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("drain of `{name}` timed out with {remaining} job(s) still pending")]
    Timeout { name: MigrationName, remaining: usize },
}

pub struct DrainController<Q: JobQueue> {
    worker: MigrationWorker<Q>,
    tracker: CompletionTracker<Q>,
    config: DrainConfig,
}

impl<Q: JobQueue + Clone> DrainController<Q> {
    pub fn new(worker: MigrationWorker<Q>, config: DrainConfig) -> Self {
        let tracker = CompletionTracker::new(worker.queue().clone());
        Self {
            worker,
            tracker,
            config,
        }
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    /// Claim and execute jobs for `name` until none are pending.
    pub fn drain(&self, name: &MigrationName) -> Result<DrainReport, DrainError> {
        let span = info_span!("drain", migration = %name, policy = ?self.config.delay_policy);
        let _entered = span.enter();

        let filter = ClaimFilter::named(name.clone())
            .ignoring_delay(self.config.delay_policy == DelayPolicy::Immediate);
        let started = Instant::now();
        let mut report = DrainReport::default();

        info!("draining migration jobs");
        loop {
            if let Some(job) = self.worker.claim(&filter)? {
                let outcome = self.worker.execute(job)?;
                report.record(&outcome);
                continue;
            }

            let remaining = self.tracker.count_pending(name)?;
            if remaining == 0 {
                break;
            }

            if self.config.deadline.is_some_and(|d| started.elapsed() >= d) {
                return Err(DrainError::Timeout {
                    name: name.clone(),
                    remaining,
                });
            }

            debug!(remaining, "remaining jobs are delayed or claimed elsewhere; waiting");
            thread::sleep(self.config.poll_interval);
        }

        info!(
            executed = report.executed,
            succeeded = report.succeeded,
            retried = report.retried,
            dead_lettered = report.dead_lettered,
            superseded = report.superseded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "drain complete"
        );
        Ok(report)
    }
}
