//! Completion tracking per migration name.

use bgmigrate_core::MigrationName;

use super::store::{JobQueue, QueueError};

/// Answers "is this migration done?".
///
/// A job counts as pending from enqueue until it is acknowledged or
/// dead-lettered, whether it is eligible, delayed, or currently running.
#[derive(Debug, Clone)]
pub struct CompletionTracker<Q: JobQueue> {
    queue: Q,
}

impl<Q: JobQueue> CompletionTracker<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    pub fn has_pending(&self, name: &MigrationName) -> Result<bool, QueueError> {
        Ok(self.queue.count_pending(name)? > 0)
    }

    pub fn count_pending(&self, name: &MigrationName) -> Result<usize, QueueError> {
        self.queue.count_pending(name)
    }

    /// Jobs for `name` that ended in the dead-letter queue.
    pub fn count_dead(&self, name: &MigrationName) -> Result<usize, QueueError> {
        self.queue.count_dead(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobQueue;
    use crate::jobs::types::{ClaimFilter, ScheduledJob};
    use bgmigrate_core::ArgumentList;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pending_covers_delayed_and_running_jobs() {
        let queue = InMemoryJobQueue::arc();
        let tracker = CompletionTracker::new(queue.clone());
        let extract = MigrationName::new("ExtractUrl").unwrap();
        let other = MigrationName::new("NormalizeEmail").unwrap();

        assert!(!tracker.has_pending(&extract).unwrap());

        queue
            .enqueue(ScheduledJob::named(extract.clone(), ArgumentList::record(1)))
            .unwrap();
        queue
            .enqueue(
                ScheduledJob::named(extract.clone(), ArgumentList::record(2))
                    .delayed(Duration::from_secs(600))
                    .unwrap(),
            )
            .unwrap();
        let running = queue
            .claim_next(&ClaimFilter::any(), Duration::from_secs(60))
            .unwrap()
            .unwrap();

        assert_eq!(tracker.count_pending(&extract).unwrap(), 2);
        assert!(!tracker.has_pending(&other).unwrap());

        queue.dead_letter(running, "boom".to_string()).unwrap();
        assert_eq!(tracker.count_pending(&extract).unwrap(), 1);
        assert_eq!(tracker.count_dead(&extract).unwrap(), 1);
    }

    #[test]
    fn shares_queue_through_arc() {
        let queue: Arc<InMemoryJobQueue> = InMemoryJobQueue::arc();
        let a = CompletionTracker::new(queue.clone());
        let b = CompletionTracker::new(queue);
        let name = MigrationName::new("ExtractUrl").unwrap();

        a.queue
            .enqueue(ScheduledJob::named(name.clone(), ArgumentList::record(1)))
            .unwrap();
        assert!(b.has_pending(&name).unwrap());
    }
}
