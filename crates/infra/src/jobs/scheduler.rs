//! Scheduling API used by application code and deploy scripts.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use bgmigrate_core::{ArgumentList, JobId, JobPayload, MigrationName};

use super::store::{JobQueue, QueueError};
use super::types::{after, ScheduledJob};

/// Enqueues migration jobs.
///
/// The scheduler only validates that the name is well-formed; whether a unit
/// is registered under it is decided by the worker at execution time.
#[derive(Debug, Clone)]
pub struct Scheduler<Q: JobQueue> {
    queue: Q,
}

impl<Q: JobQueue> Scheduler<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Enqueue one job, eligible immediately.
    pub fn schedule_one(&self, name: &MigrationName, args: ArgumentList) -> Result<JobId, QueueError> {
        let id = self.queue.enqueue(ScheduledJob::named(name.clone(), args))?;
        debug!(job_id = %id, migration = %name, "scheduled migration job");
        Ok(id)
    }

    /// Enqueue one job, eligible after `delay`.
    pub fn schedule_in(
        &self,
        name: &MigrationName,
        args: ArgumentList,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        let job = ScheduledJob::named(name.clone(), args).delayed(delay)?;
        let id = self.queue.enqueue(job)?;
        debug!(
            job_id = %id,
            migration = %name,
            delay_ms = delay.as_millis() as u64,
            "scheduled delayed migration job"
        );
        Ok(id)
    }

    /// Enqueue many jobs in a single queue round trip. Names may differ.
    pub fn schedule_bulk<I>(&self, payloads: I) -> Result<Vec<JobId>, QueueError>
    where
        I: IntoIterator<Item = JobPayload>,
    {
        let jobs: Vec<_> = payloads.into_iter().map(ScheduledJob::new).collect();
        self.enqueue_all(jobs)
    }

    /// Like [`Scheduler::schedule_bulk`], with no job eligible before
    /// `now + delay`.
    pub fn schedule_bulk_delayed<I>(&self, delay: Duration, payloads: I) -> Result<Vec<JobId>, QueueError>
    where
        I: IntoIterator<Item = JobPayload>,
    {
        let not_before = after(Utc::now(), delay)?;
        let jobs: Vec<_> = payloads
            .into_iter()
            .map(|p| ScheduledJob::new(p).not_before(not_before))
            .collect();
        self.enqueue_all(jobs)
    }

    /// Split `ids` into batches of `batch_size` and delay batch `i` by
    /// `interval * (i + 1)`, spreading a large backfill over time.
    pub fn schedule_staggered<I>(
        &self,
        name: &MigrationName,
        ids: I,
        batch_size: usize,
        interval: Duration,
    ) -> Result<Vec<JobId>, QueueError>
    where
        I: IntoIterator<Item = i64>,
    {
        let ids: Vec<i64> = ids.into_iter().collect();
        let now = Utc::now();

        let mut jobs = Vec::with_capacity(ids.len());
        for (index, batch) in ids.chunks(batch_size.max(1)).enumerate() {
            let factor = u32::try_from(index + 1).map_err(|_| QueueError::InvalidDelay(interval))?;
            let delay = interval
                .checked_mul(factor)
                .ok_or(QueueError::InvalidDelay(interval))?;
            let not_before = after(now, delay)?;
            jobs.extend(
                batch
                    .iter()
                    .map(|&id| ScheduledJob::named(name.clone(), ArgumentList::record(id)).not_before(not_before)),
            );
        }

        self.enqueue_all(jobs)
    }

    /// Run `commit` and enqueue `jobs` only if it succeeded.
    ///
    /// Workers must not observe jobs for data that was never committed. If the
    /// commit fails nothing is enqueued.
    pub fn after_commit<T, E, F>(&self, jobs: Vec<ScheduledJob>, commit: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<QueueError>,
    {
        let value = commit()?;
        if !jobs.is_empty() {
            self.queue.enqueue_batch(jobs)?;
        }
        Ok(value)
    }

    fn enqueue_all(&self, jobs: Vec<ScheduledJob>) -> Result<Vec<JobId>, QueueError> {
        let Some(first) = jobs.first() else {
            return Ok(Vec::new());
        };
        let first_migration = first.name().clone();
        let ids = self.queue.enqueue_batch(jobs)?;
        info!(first_migration = %first_migration, count = ids.len(), "scheduled migration batch");
        Ok(ids)
    }
}

/// One `[id]` payload per record id, all for `name`.
pub fn record_payloads<I>(name: &MigrationName, ids: I) -> Vec<JobPayload>
where
    I: IntoIterator<Item = i64>,
{
    ids.into_iter()
        .map(|id| JobPayload::new(name.clone(), ArgumentList::record(id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::ClaimFilter;
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(60);

    fn name(s: &str) -> MigrationName {
        MigrationName::new(s).unwrap()
    }

    fn scheduler() -> Scheduler<Arc<InMemoryJobQueue>> {
        Scheduler::new(InMemoryJobQueue::arc())
    }

    #[test]
    fn schedule_one_is_immediately_claimable() {
        let s = scheduler();
        let id = s.schedule_one(&name("ExtractUrl"), ArgumentList::record(42)).unwrap();

        let job = s.queue().claim_next(&ClaimFilter::any(), LEASE).unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.payload.args, ArgumentList::record(42));
    }

    #[test]
    fn unknown_names_are_accepted_at_schedule_time() {
        let s = scheduler();
        s.schedule_one(&name("NotRegisteredAnywhere"), ArgumentList::empty())
            .unwrap();
        assert_eq!(s.queue().count_pending(&name("NotRegisteredAnywhere")).unwrap(), 1);
    }

    #[test]
    fn bulk_enqueues_one_job_per_payload() {
        let s = scheduler();
        let ids = s
            .schedule_bulk(record_payloads(&name("ExtractUrl"), 1..=3))
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(s.queue().count_pending(&name("ExtractUrl")).unwrap(), 3);

        assert!(s.schedule_bulk(Vec::new()).unwrap().is_empty());
        assert_eq!(s.queue().len().unwrap(), 3);
    }

    #[test]
    fn bulk_batches_may_mix_names() {
        let s = scheduler();
        s.schedule_bulk(vec![
            JobPayload::new(name("ExtractUrl"), ArgumentList::record(1)),
            JobPayload::new(name("NormalizeEmail"), ArgumentList::record(1)),
            JobPayload::new(name("NormalizeEmail"), ArgumentList::record(2)),
        ])
        .unwrap();

        assert_eq!(s.queue().count_pending(&name("ExtractUrl")).unwrap(), 1);
        assert_eq!(s.queue().count_pending(&name("NormalizeEmail")).unwrap(), 2);
    }

    #[test]
    fn delayed_jobs_are_pending_but_not_claimable() {
        let s = scheduler();
        s.schedule_bulk_delayed(
            Duration::from_secs(3600),
            vec![
                JobPayload::new(name("ExtractUrl"), ArgumentList::record(1)),
                JobPayload::new(name("ExtractUrl"), ArgumentList::record(2)),
            ],
        )
        .unwrap();
        s.schedule_in(&name("ExtractUrl"), ArgumentList::record(3), Duration::from_secs(3600))
            .unwrap();

        assert_eq!(s.queue().count_pending(&name("ExtractUrl")).unwrap(), 3);
        assert!(s.queue().claim_next(&ClaimFilter::any(), LEASE).unwrap().is_none());
        assert!(
            s.queue()
                .claim_next(&ClaimFilter::any().ignoring_delay(true), LEASE)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn staggered_batches_get_increasing_delays() {
        let s = scheduler();
        let ids = s
            .schedule_staggered(&name("ExtractUrl"), 1..=5, 2, Duration::from_secs(60))
            .unwrap();
        assert_eq!(ids.len(), 5);

        let not_before: Vec<_> = ids
            .iter()
            .map(|id| s.queue().get(*id).unwrap().unwrap().not_before.unwrap())
            .collect();
        let offsets: Vec<i64> = not_before
            .iter()
            .map(|at| (*at - not_before[0]).num_seconds())
            .collect();
        // Batches [1,2] [3,4] [5] at 60s, 120s, 180s.
        assert_eq!(offsets, vec![0, 0, 60, 60, 120]);
        assert!(not_before[0] > Utc::now() + chrono::Duration::seconds(50));
    }

    #[test]
    fn after_commit_enqueues_only_on_success() {
        #[derive(Debug, PartialEq)]
        enum TxError {
            Rollback,
            Queue(QueueError),
        }
        impl From<QueueError> for TxError {
            fn from(e: QueueError) -> Self {
                TxError::Queue(e)
            }
        }

        let s = scheduler();
        let job = || vec![ScheduledJob::named(name("ExtractUrl"), ArgumentList::record(7))];

        let failed: Result<(), TxError> = s.after_commit(job(), || Err(TxError::Rollback));
        assert_eq!(failed, Err(TxError::Rollback));
        assert_eq!(s.queue().len().unwrap(), 0);

        let committed: Result<u32, TxError> = s.after_commit(job(), || Ok(1));
        assert_eq!(committed, Ok(1));
        assert_eq!(s.queue().len().unwrap(), 1);
    }
}
