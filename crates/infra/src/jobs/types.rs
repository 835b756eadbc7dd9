//! Scheduled job records and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bgmigrate_core::{ArgumentList, JobId, JobPayload, MigrationName};

use super::store::QueueError;

/// Where a queued job is in its lifecycle.
///
/// Acknowledged jobs are deleted, so there is no `Completed` state: anything
/// still in the queue is outstanding work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobState {
    /// Waiting for a worker (possibly not yet eligible, see `not_before`).
    Pending,
    /// Claimed by a worker. Claimable again once the lease expires.
    Running { lease_expires_at: DateTime<Utc> },
}

/// A migration job sitting in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    /// Number of times the job has been claimed.
    pub attempt: u32,
    /// Not eligible before this instant (delayed scheduling or retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Pending,
            attempt: 0,
            not_before: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn named(name: MigrationName, args: ArgumentList) -> Self {
        Self::new(JobPayload::new(name, args))
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }

    /// Delay eligibility by `delay` from now.
    pub fn delayed(self, delay: Duration) -> Result<Self, QueueError> {
        let at = after(Utc::now(), delay)?;
        Ok(self.not_before(at))
    }

    pub fn name(&self) -> &MigrationName {
        &self.payload.name
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, JobState::Running { .. })
    }

    /// Whether a claim at `now` may take this job.
    ///
    /// A pending job is claimable once `not_before` has passed (or always, when
    /// `ignore_delay` is set). A running job is claimable only after its lease
    /// expired, which is how a crashed worker's job gets redelivered.
    pub fn is_claimable(&self, now: DateTime<Utc>, ignore_delay: bool) -> bool {
        match self.state {
            JobState::Pending => ignore_delay || self.not_before.is_none_or(|at| at <= now),
            JobState::Running { lease_expires_at } => lease_expires_at < now,
        }
    }

    pub fn mark_claimed(&mut self, now: DateTime<Utc>, lease: Duration) -> Result<(), QueueError> {
        self.state = JobState::Running {
            lease_expires_at: after(now, lease)?,
        };
        self.attempt += 1;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_requeued(&mut self, not_before: DateTime<Utc>, error: &str) {
        self.state = JobState::Pending;
        self.not_before = Some(not_before);
        self.last_error = Some(error.to_string());
        self.updated_at = Utc::now();
    }
}

/// `at + delay`, rejecting delays chrono cannot represent.
pub fn after(at: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, QueueError> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .ok_or(QueueError::InvalidDelay(delay))
}

/// Which jobs a claim may take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Only jobs for this migration (drain); `None` takes any (workers).
    pub name: Option<MigrationName>,
    /// Treat delayed jobs as eligible right away.
    pub ignore_delay: bool,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn named(name: MigrationName) -> Self {
        Self {
            name: Some(name),
            ignore_delay: false,
        }
    }

    pub fn ignoring_delay(mut self, ignore: bool) -> Self {
        self.ignore_delay = ignore;
        self
    }

    pub fn matches(&self, job: &ScheduledJob) -> bool {
        self.name.as_ref().is_none_or(|n| n == job.name())
    }
}

/// A job removed from the queue because it can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: ScheduledJob,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(job: ScheduledJob, reason: String) -> Self {
        Self {
            job,
            reason,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// One execution of a unit for one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRun {
    pub job_id: JobId,
    pub name: MigrationName,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl MigrationRun {
    pub fn for_job(job: &ScheduledJob) -> Self {
        Self {
            job_id: job.id,
            name: job.name().clone(),
            attempt: job.attempt,
            started_at: Utc::now(),
        }
    }
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Performed and acknowledged.
    Succeeded,
    /// Transient failure; back in the queue until `retry_at`.
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// Terminal failure; moved to the dead-letter queue.
    DeadLettered { reason: String },
    /// The lease ran out mid-run and another claimer owns the job now; this
    /// run's failure was discarded.
    Superseded,
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// How transient failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0), applied deterministically per attempt.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Fail terminally on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms * f64::from(attempt),
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt.min(62) as i32 - 1),
        };
        let delay_ms = raw_ms.min(max_ms);

        // Spread in [-jitter, +jitter] derived from the attempt number.
        let spread = ((f64::from(attempt) * 17.0) % 100.0) / 100.0;
        let jitter_ms = delay_ms * self.jitter.clamp(0.0, 1.0) * (spread - 0.5) * 2.0;

        Duration::from_millis((delay_ms + jitter_ms).max(0.0) as u64)
    }

    /// Whether a job that just failed its `attempt`-th try may run again.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
