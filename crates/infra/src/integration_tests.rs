//! End-to-end scenarios: Scheduler → queue → worker/drain → unit → record store.
//!
//! Verifies:
//! - Draining leaves nothing pending and runs every job
//! - Vanished records and duplicate deliveries are harmless
//! - Retry, dead-letter and replay behave as operators expect
//! - A crashed claim is redelivered after its lease

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use bgmigrate_core::{ArgumentList, MigrationName, RecordId};
    use bgmigrate_migrations::{
        ExtractUrl, FieldValue, InMemoryRecordStore, MigrationRegistry, MigrationUnit, NormalizeEmail,
        Record, RecordStore,
    };
    use proptest::prelude::*;

    use crate::jobs::{
        ClaimFilter, CompletionTracker, CountingFailureSink, DrainConfig, DrainController,
        InMemoryJobQueue, JobQueue, MigrationWorker, RetryPolicy, RunOutcome, Scheduler,
        WorkerConfig, record_payloads,
    };

    type Queue = Arc<InMemoryJobQueue>;

    struct Engine {
        queue: Queue,
        store: Arc<InMemoryRecordStore>,
        registry: Arc<MigrationRegistry>,
        sink: Arc<CountingFailureSink>,
    }

    impl Engine {
        fn new(registry: MigrationRegistry) -> Self {
            Self {
                queue: InMemoryJobQueue::arc(),
                store: InMemoryRecordStore::arc(),
                registry: Arc::new(registry),
                sink: Arc::new(CountingFailureSink::new()),
            }
        }

        fn standard() -> Self {
            Self::new(MigrationRegistry::standard().unwrap())
        }

        fn scheduler(&self) -> Scheduler<Queue> {
            Scheduler::new(self.queue.clone())
        }

        fn tracker(&self) -> CompletionTracker<Queue> {
            CompletionTracker::new(self.queue.clone())
        }

        fn worker(&self) -> MigrationWorker<Queue> {
            MigrationWorker::new(self.queue.clone(), self.registry.clone(), self.store.clone())
                .with_retry_policy(RetryPolicy::fixed(3, Duration::from_millis(10)))
                .with_failure_sink(self.sink.clone())
        }

        fn drainer(&self) -> DrainController<Queue> {
            DrainController::new(
                self.worker(),
                DrainConfig::default().with_poll_interval(Duration::from_millis(5)),
            )
        }
    }

    fn name(s: &str) -> MigrationName {
        MigrationName::new(s).unwrap()
    }

    fn link(payload: &str) -> Record {
        Record::new()
            .with("payload", FieldValue::text(payload))
            .with("url", FieldValue::Null)
    }

    /// Wraps a unit and counts executions per record id.
    struct Counted<U> {
        inner: U,
        calls: Arc<Mutex<HashMap<i64, usize>>>,
    }

    impl<U: MigrationUnit> MigrationUnit for Counted<U> {
        fn name(&self) -> &'static str {
            self.inner.name()
        }

        fn perform(
            &self,
            store: &dyn RecordStore,
            args: &ArgumentList,
        ) -> bgmigrate_core::MigrationResult<()> {
            let id = args.record_id(0)?.get();
            *self.calls.lock().unwrap().entry(id).or_default() += 1;
            self.inner.perform(store, args)
        }
    }

    #[test]
    fn extract_url_scenario_with_a_deleted_record() {
        let engine = Engine::standard();
        engine
            .store
            .insert("links", RecordId(42), link(r#"{"url":"http://x"}"#)).unwrap();
        // Record 43 was deleted before the job ran.

        let extract = name("ExtractUrl");
        engine
            .scheduler()
            .schedule_one(&extract, ArgumentList::record(42))
            .unwrap();
        engine
            .scheduler()
            .schedule_one(&extract, ArgumentList::record(43))
            .unwrap();
        assert!(engine.tracker().has_pending(&extract).unwrap());

        let report = engine.drainer().drain(&extract).unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.dead_lettered, 0);
        let row = engine.store.fetch("links", RecordId(42)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x"));
        assert_eq!(engine.store.fetch("links", RecordId(43)).unwrap(), None);
        assert!(!engine.tracker().has_pending(&extract).unwrap());
        assert_eq!(engine.sink.total(), 0);
    }

    #[test]
    fn duplicate_delivery_converges() {
        let engine = Engine::standard();
        engine
            .store
            .insert("links", RecordId(42), link(r#"{"url":"http://x"}"#)).unwrap();

        let extract = name("ExtractUrl");
        for _ in 0..2 {
            engine
                .scheduler()
                .schedule_one(&extract, ArgumentList::record(42))
                .unwrap();
        }

        let report = engine.drainer().drain(&extract).unwrap();

        assert_eq!(report.succeeded, 2);
        let row = engine.store.fetch("links", RecordId(42)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x"));
        // The second run found the value already in place.
        assert_eq!(engine.store.writes(), 1);
    }

    #[test]
    fn delayed_bulk_shows_pending_before_eligibility() {
        let engine = Engine::standard();
        let normalize = name("NormalizeEmail");
        for id in 1..=3 {
            engine.store.insert(
                "users",
                RecordId(id),
                Record::new().with("email", FieldValue::text(format!(" User{id}@Example.com"))),
            ).unwrap();
        }

        let delay = Duration::from_millis(150);
        engine
            .scheduler()
            .schedule_bulk_delayed(delay, record_payloads(&normalize, 1..=3))
            .unwrap();

        assert_eq!(engine.tracker().count_pending(&normalize).unwrap(), 3);
        assert_eq!(engine.worker().run_once().unwrap(), None);

        let started = Instant::now();
        engine.drainer().drain(&normalize).unwrap();
        assert!(started.elapsed() >= delay - Duration::from_millis(20));

        assert!(!engine.tracker().has_pending(&normalize).unwrap());
        let row = engine.store.fetch("users", RecordId(2)).unwrap().unwrap();
        assert_eq!(row.text("email_normalized"), Some("user2@example.com"));
    }

    #[test]
    fn outage_retries_then_dead_letters_and_replays() {
        let engine = Engine::standard();
        engine
            .store
            .insert("links", RecordId(7), link(r#"{"url":"http://seven"}"#)).unwrap();
        engine.store.set_unavailable(true);

        let extract = name("ExtractUrl");
        let id = engine
            .scheduler()
            .schedule_one(&extract, ArgumentList::record(7))
            .unwrap();

        let report = engine.drainer().drain(&extract).unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(report.retried, 2);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(engine.tracker().count_dead(&extract).unwrap(), 1);
        assert_eq!(engine.sink.count(&extract), 1);

        let dead = engine.queue.list_dead_letters(Some(&extract), 10).unwrap();
        assert!(dead[0].reason.starts_with("gave up after 3 attempts"));
        assert_eq!(dead[0].job.attempt, 3);

        // Operator fixes the outage and replays the dead letter.
        engine.store.set_unavailable(false);
        engine.queue.retry_dead_letter(id).unwrap();
        let report = engine.drainer().drain(&extract).unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(engine.tracker().count_dead(&extract).unwrap(), 0);
        let row = engine.store.fetch("links", RecordId(7)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://seven"));
    }

    #[test]
    fn unregistered_name_is_terminal_without_retry() {
        let engine = Engine::standard();
        let gone = name("RemovedInLastRelease");
        engine
            .scheduler()
            .schedule_one(&gone, ArgumentList::record(1))
            .unwrap();

        let report = engine.drainer().drain(&gone).unwrap();

        assert_eq!(report.executed, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.retried, 0);
        let dead = engine.queue.list_dead_letters(None, 10).unwrap();
        assert_eq!(dead[0].reason, "no migration registered as `RemovedInLastRelease`");
    }

    #[test]
    fn malformed_arguments_are_terminal() {
        let engine = Engine::standard();
        let extract = name("ExtractUrl");
        engine
            .scheduler()
            .schedule_one(&extract, ArgumentList::empty().push("not-an-id"))
            .unwrap();

        let outcome = engine.worker().run_once().unwrap().unwrap();
        assert!(matches!(outcome, RunOutcome::DeadLettered { .. }));
        assert!(!engine.tracker().has_pending(&extract).unwrap());
    }

    #[test]
    fn crashed_claim_is_redelivered_after_lease() {
        let engine = Engine::standard();
        engine
            .store
            .insert("links", RecordId(42), link(r#"{"url":"http://x"}"#)).unwrap();
        let extract = name("ExtractUrl");
        engine
            .scheduler()
            .schedule_one(&extract, ArgumentList::record(42))
            .unwrap();

        // A worker claims with a tiny lease and dies without acking.
        let lost = engine
            .queue
            .claim_next(&ClaimFilter::any(), Duration::from_millis(1))
            .unwrap()
            .unwrap();
        thread::sleep(Duration::from_millis(10));

        assert!(engine.tracker().has_pending(&extract).unwrap());
        let outcome = engine.worker().run_once().unwrap();
        assert_eq!(outcome, Some(RunOutcome::Succeeded));

        // The dead worker's late ack is ignored; the job is already gone.
        assert!(!engine.queue.ack(&lost).unwrap());
        assert!(!engine.tracker().has_pending(&extract).unwrap());
        let row = engine.store.fetch("links", RecordId(42)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x"));
    }

    #[test]
    fn workers_and_drainers_share_the_queue_without_double_claims() {
        let calls = Arc::new(Mutex::new(HashMap::new()));
        let mut registry = MigrationRegistry::new();
        registry
            .register(Counted {
                inner: ExtractUrl,
                calls: calls.clone(),
            })
            .unwrap();
        let engine = Engine::new(registry);

        let extract = name("ExtractUrl");
        for id in 0..300 {
            engine.store.insert(
                "links",
                RecordId(id),
                link(&format!(r#"{{"url":"http://x/{id}"}}"#)),
            ).unwrap();
        }
        engine
            .scheduler()
            .schedule_bulk(record_payloads(&extract, 0..300))
            .unwrap();

        let pool = engine
            .worker()
            .spawn(
                WorkerConfig::default()
                    .with_workers(2)
                    .with_poll_interval(Duration::from_millis(5)),
            )
            .unwrap();
        let drainers: Vec<_> = (0..2)
            .map(|_| {
                let drain = engine.drainer();
                let extract = extract.clone();
                thread::spawn(move || drain.drain(&extract).unwrap())
            })
            .collect();
        for d in drainers {
            d.join().unwrap();
        }
        pool.shutdown();

        assert!(!engine.tracker().has_pending(&extract).unwrap());
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 300);
        assert!(calls.values().all(|&n| n == 1));
        let row = engine.store.fetch("links", RecordId(299)).unwrap().unwrap();
        assert_eq!(row.text("url"), Some("http://x/299"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn bulk_then_drain_runs_every_job(ids in proptest::collection::btree_set(0i64..10_000, 0..40)) {
            let calls = Arc::new(Mutex::new(HashMap::new()));
            let mut registry = MigrationRegistry::new();
            registry
                .register(Counted { inner: NormalizeEmail, calls: calls.clone() })
                .unwrap();
            let engine = Engine::new(registry);
            let normalize = name("NormalizeEmail");

            engine
                .scheduler()
                .schedule_bulk(record_payloads(&normalize, ids.iter().copied()))
                .unwrap();
            let report = engine.drainer().drain(&normalize).unwrap();

            prop_assert!(!engine.tracker().has_pending(&normalize).unwrap());
            prop_assert_eq!(report.succeeded, ids.len());
            let calls = calls.lock().unwrap();
            prop_assert_eq!(calls.len(), ids.len());
            prop_assert!(calls.values().all(|&n| n == 1));
        }
    }
}
