//! Queue abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use bgmigrate_core::{JobId, MigrationName};

use super::types::{ClaimFilter, DeadLetterEntry, JobState, ScheduledJob};

/// Durable queue of migration jobs.
///
/// The queue is the only synchronization point between workers and drainers:
/// `claim_next` must hand any given job to at most one caller per lease.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, QueueError>;

    /// Enqueue many jobs in one round trip. An empty batch is a no-op.
    fn enqueue_batch(&self, jobs: Vec<ScheduledJob>) -> Result<Vec<JobId>, QueueError>;

    /// Atomically claim the oldest claimable job matching `filter`.
    ///
    /// The returned job is `Running` with its attempt counter incremented. If
    /// it is not acknowledged before `lease` elapses it becomes claimable again.
    fn claim_next(
        &self,
        filter: &ClaimFilter,
        lease: Duration,
    ) -> Result<Option<ScheduledJob>, QueueError>;

    /// Remove a finished job.
    ///
    /// Returns `false` if the job is gone or was re-claimed by someone else
    /// after our lease expired (their run will acknowledge it).
    fn ack(&self, job: &ScheduledJob) -> Result<bool, QueueError>;

    /// Put a claimed job back as pending, eligible again at `not_before`.
    fn requeue(
        &self,
        job: &ScheduledJob,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError>;

    /// Move a claimed job to the dead-letter queue.
    ///
    /// Returns `None` and leaves the queue untouched if the job is gone or was
    /// re-claimed after our lease expired, same as [`JobQueue::ack`].
    fn dead_letter(
        &self,
        job: ScheduledJob,
        reason: String,
    ) -> Result<Option<DeadLetterEntry>, QueueError>;

    /// Jobs still queued for `name`: pending (eligible or delayed) and claimed
    /// but not yet acknowledged.
    fn count_pending(&self, name: &MigrationName) -> Result<usize, QueueError>;

    fn count_dead(&self, name: &MigrationName) -> Result<usize, QueueError>;

    /// Oldest dead letters first.
    fn list_dead_letters(
        &self,
        name: Option<&MigrationName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError>;

    /// Move a dead letter back into the queue with a fresh attempt counter.
    fn retry_dead_letter(&self, id: JobId) -> Result<ScheduledJob, QueueError>;

    fn delete_dead_letter(&self, id: JobId) -> Result<(), QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("delay out of range: {0:?}")]
    InvalidDelay(Duration),
    #[error("failed to decode job: {0}")]
    Serialization(String),
    /// A claimed row could not be decoded; it was moved to the dead-letter
    /// queue instead of being handed out.
    #[error("job {id} could not be decoded and was dead-lettered: {reason}")]
    Undecodable { id: JobId, reason: String },
    #[error("queue storage error: {0}")]
    Storage(String),
}

impl<Q> JobQueue for Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, QueueError> {
        (**self).enqueue(job)
    }

    fn enqueue_batch(&self, jobs: Vec<ScheduledJob>) -> Result<Vec<JobId>, QueueError> {
        (**self).enqueue_batch(jobs)
    }

    fn claim_next(
        &self,
        filter: &ClaimFilter,
        lease: Duration,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        (**self).claim_next(filter, lease)
    }

    fn ack(&self, job: &ScheduledJob) -> Result<bool, QueueError> {
        (**self).ack(job)
    }

    fn requeue(
        &self,
        job: &ScheduledJob,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError> {
        (**self).requeue(job, not_before, error)
    }

    fn dead_letter(
        &self,
        job: ScheduledJob,
        reason: String,
    ) -> Result<Option<DeadLetterEntry>, QueueError> {
        (**self).dead_letter(job, reason)
    }

    fn count_pending(&self, name: &MigrationName) -> Result<usize, QueueError> {
        (**self).count_pending(name)
    }

    fn count_dead(&self, name: &MigrationName) -> Result<usize, QueueError> {
        (**self).count_dead(name)
    }

    fn list_dead_letters(
        &self,
        name: Option<&MigrationName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        (**self).list_dead_letters(name, limit)
    }

    fn retry_dead_letter(&self, id: JobId) -> Result<ScheduledJob, QueueError> {
        (**self).retry_dead_letter(id)
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), QueueError> {
        (**self).delete_dead_letter(id)
    }
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::Storage("queue lock poisoned".to_string())
}

/// In-memory queue for tests/dev.
///
/// Claims happen under a single write lock, so concurrent claimers in one
/// process never receive the same job. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    // Keyed by UUIDv7 job id, so iteration order is enqueue order.
    jobs: RwLock<BTreeMap<JobId, ScheduledJob>>,
    dead_letters: RwLock<HashMap<JobId, DeadLetterEntry>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Current copy of a queued job.
    pub fn get(&self, id: JobId) -> Result<Option<ScheduledJob>, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&id).cloned())
    }

    /// Total number of queued jobs across all names.
    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.jobs.read().map_err(poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: ScheduledJob) -> Result<JobId, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn enqueue_batch(&self, batch: Vec<ScheduledJob>) -> Result<Vec<JobId>, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if let Some(dup) = batch.iter().find(|j| jobs.contains_key(&j.id)) {
            return Err(QueueError::AlreadyExists(dup.id));
        }

        let mut ids = Vec::with_capacity(batch.len());
        for job in batch {
            ids.push(job.id);
            jobs.insert(job.id, job);
        }
        Ok(ids)
    }

    fn claim_next(
        &self,
        filter: &ClaimFilter,
        lease: Duration,
    ) -> Result<Option<ScheduledJob>, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let now = Utc::now();

        let Some(job) = jobs
            .values_mut()
            .find(|j| filter.matches(j) && j.is_claimable(now, filter.ignore_delay))
        else {
            return Ok(None);
        };

        job.mark_claimed(now, lease)?;
        Ok(Some(job.clone()))
    }

    fn ack(&self, job: &ScheduledJob) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get(&job.id) {
            Some(current) if current.attempt == job.attempt => {
                jobs.remove(&job.id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn requeue(
        &self,
        job: &ScheduledJob,
        not_before: DateTime<Utc>,
        error: &str,
    ) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        match jobs.get_mut(&job.id) {
            Some(current) if current.attempt == job.attempt => {
                current.mark_requeued(not_before, error);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn dead_letter(
        &self,
        mut job: ScheduledJob,
        reason: String,
    ) -> Result<Option<DeadLetterEntry>, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dead = self.dead_letters.write().map_err(poisoned)?;

        match jobs.get(&job.id) {
            Some(current) if current.attempt == job.attempt => {
                jobs.remove(&job.id);
            }
            _ => return Ok(None),
        }
        job.state = JobState::Pending;
        job.last_error = Some(reason.clone());
        job.updated_at = Utc::now();

        let entry = DeadLetterEntry::new(job, reason);
        dead.insert(entry.job.id, entry.clone());
        Ok(Some(entry))
    }

    fn count_pending(&self, name: &MigrationName) -> Result<usize, QueueError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.values().filter(|j| j.name() == name).count())
    }

    fn count_dead(&self, name: &MigrationName) -> Result<usize, QueueError> {
        let dead = self.dead_letters.read().map_err(poisoned)?;
        Ok(dead.values().filter(|e| e.job.name() == name).count())
    }

    fn list_dead_letters(
        &self,
        name: Option<&MigrationName>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, QueueError> {
        let dead = self.dead_letters.read().map_err(poisoned)?;
        let mut result: Vec<_> = dead
            .values()
            .filter(|e| name.is_none_or(|n| e.job.name() == n))
            .cloned()
            .collect();

        result.sort_by_key(|e| (e.dead_lettered_at, e.job.id));
        result.truncate(limit);
        Ok(result)
    }

    fn retry_dead_letter(&self, id: JobId) -> Result<ScheduledJob, QueueError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let mut dead = self.dead_letters.write().map_err(poisoned)?;

        let entry = dead.remove(&id).ok_or(QueueError::NotFound(id))?;
        let mut job = entry.job;
        job.state = JobState::Pending;
        job.attempt = 0;
        job.not_before = None;
        job.updated_at = Utc::now();

        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn delete_dead_letter(&self, id: JobId) -> Result<(), QueueError> {
        let mut dead = self.dead_letters.write().map_err(poisoned)?;
        dead.remove(&id).map(|_| ()).ok_or(QueueError::NotFound(id))
    }
}
