//! Worker runtime: claim, resolve, perform, then ack / requeue / dead-letter.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use bgmigrate_core::MigrationError;
use bgmigrate_migrations::{MigrationRegistry, RecordStore};

use super::sink::{FailureSink, TracingFailureSink};
use super::store::{JobQueue, QueueError};
use super::types::{after, ClaimFilter, MigrationRun, RetryPolicy, RunOutcome, ScheduledJob};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue has nothing claimable.
    pub poll_interval: Duration,
    /// Number of worker threads.
    pub workers: usize,
    /// Thread name prefix and log label.
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            workers: 4,
            name: "migration-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Counters across all threads of a running pool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_superseded: u64,
    pub queue_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &RunOutcome) {
        self.jobs_processed += 1;
        match outcome {
            RunOutcome::Succeeded => self.jobs_succeeded += 1,
            RunOutcome::Retrying { .. } => self.jobs_retried += 1,
            RunOutcome::DeadLettered { .. } => self.jobs_dead_lettered += 1,
            RunOutcome::Superseded => self.jobs_superseded += 1,
        }
    }
}

/// Handle to a running worker pool.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop polling, wait for in-flight jobs to finish, and return the final
    /// counters.
    pub fn shutdown(self) -> WorkerStats {
        self.shutdown.store(true, Ordering::SeqCst);
        for join in self.joins {
            let _ = join.join();
        }
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Executes claimed migration jobs.
///
/// Units only ever see the record store and their arguments. Classification
/// of a run:
/// - unknown name, bad arguments, fatal unit error, panic: dead-letter
/// - transient error: requeue with backoff until the retry ceiling, then
///   dead-letter
/// - success: acknowledge
pub struct MigrationWorker<Q: JobQueue> {
    queue: Q,
    registry: Arc<MigrationRegistry>,
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
    lease: Duration,
    sink: Arc<dyn FailureSink>,
}

impl<Q: JobQueue> MigrationWorker<Q> {
    pub fn new(queue: Q, registry: Arc<MigrationRegistry>, store: Arc<dyn RecordStore>) -> Self {
        Self {
            queue,
            registry,
            store,
            policy: RetryPolicy::default(),
            lease: Duration::from_secs(300),
            sink: Arc::new(TracingFailureSink),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long a claim stays exclusive before the job is redelivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_failure_sink(mut self, sink: Arc<dyn FailureSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Claim the next job matching `filter`.
    ///
    /// Rows the queue could not decode are already dead-lettered by it; they
    /// are reported to the failure sink and the claim moves on.
    pub fn claim(&self, filter: &ClaimFilter) -> Result<Option<ScheduledJob>, QueueError> {
        loop {
            match self.queue.claim_next(filter, self.lease) {
                Err(QueueError::Undecodable { id, reason }) => self.sink.job_undecodable(id, &reason),
                claimed => return claimed,
            }
        }
    }

    /// Claim and execute one job, if any is claimable.
    pub fn run_once(&self) -> Result<Option<RunOutcome>, QueueError> {
        match self.claim(&ClaimFilter::any())? {
            Some(job) => self.execute(job).map(Some),
            None => Ok(None),
        }
    }

    /// Execute a job previously returned by `claim`.
    ///
    /// An error here means the outcome could not be recorded in the queue; the
    /// job stays claimed and is redelivered once its lease expires.
    pub fn execute(&self, job: ScheduledJob) -> Result<RunOutcome, QueueError> {
        let run = MigrationRun::for_job(&job);
        let span = info_span!(
            "migration_run",
            job_id = %run.job_id,
            migration = %run.name,
            attempt = run.attempt
        );
        let _entered = span.enter();
        let started = Instant::now();

        let result = self.perform(&job);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                if !self.queue.ack(&job)? {
                    debug!("job was re-claimed after lease expiry; leaving ack to the new owner");
                }
                debug!(elapsed_ms, "migration job succeeded");
                Ok(RunOutcome::Succeeded)
            }
            Err(err) if err.is_retryable() && self.policy.allows_retry(job.attempt) => {
                let delay = self.policy.backoff(job.attempt);
                let retry_at = after(Utc::now(), delay)?;
                let error = err.to_string();
                if !self.queue.requeue(&job, retry_at, &error)? {
                    warn!(elapsed_ms, error = %error, "job was re-claimed after lease expiry; dropping retry");
                    return Ok(RunOutcome::Superseded);
                }
                warn!(
                    elapsed_ms,
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "migration job failed; will retry"
                );
                Ok(RunOutcome::Retrying {
                    attempt: job.attempt,
                    retry_at,
                    error,
                })
            }
            Err(err) => {
                let reason = if err.is_retryable() {
                    format!("gave up after {} attempts: {err}", job.attempt)
                } else {
                    err.to_string()
                };
                match self.queue.dead_letter(job, reason.clone())? {
                    Some(entry) => {
                        self.sink.job_dead_lettered(&entry);
                        Ok(RunOutcome::DeadLettered { reason })
                    }
                    None => {
                        warn!(elapsed_ms, reason = %reason, "job was re-claimed after lease expiry; not dead-lettering");
                        Ok(RunOutcome::Superseded)
                    }
                }
            }
        }
    }

    fn perform(&self, job: &ScheduledJob) -> Result<(), MigrationError> {
        let unit = self.registry.resolve(job.name())?;
        let store = self.store.as_ref();
        let args = &job.payload.args;

        panic::catch_unwind(AssertUnwindSafe(|| unit.perform(store, args))).unwrap_or_else(|panic| {
            let msg = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(MigrationError::fatal(format!("unit panicked: {msg}")))
        })
    }
}

impl<Q: JobQueue + 'static> MigrationWorker<Q> {
    /// Spawn `config.workers` polling threads.
    pub fn spawn(self, config: WorkerConfig) -> io::Result<WorkerHandle> {
        let worker = Arc::new(self);
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(WorkerStats::default()));

        let mut joins = Vec::with_capacity(config.workers);
        for index in 0..config.workers.max(1) {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            let stats = stats.clone();
            let config = config.clone();
            let join = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || worker_loop(&worker, &config, &shutdown, &stats))?;
            joins.push(join);
        }

        Ok(WorkerHandle {
            shutdown,
            joins,
            stats,
        })
    }
}

fn worker_loop<Q: JobQueue>(
    worker: &MigrationWorker<Q>,
    config: &WorkerConfig,
    shutdown: &AtomicBool,
    stats: &Mutex<WorkerStats>,
) {
    info!(worker = %config.name, "migration worker started");

    while !shutdown.load(Ordering::SeqCst) {
        match worker.run_once() {
            Ok(Some(outcome)) => {
                if let Ok(mut s) = stats.lock() {
                    s.record(&outcome);
                }
            }
            Ok(None) => thread::sleep(config.poll_interval),
            Err(e) => {
                error!(worker = %config.name, error = %e, "queue operation failed");
                if let Ok(mut s) = stats.lock() {
                    s.queue_errors += 1;
                }
                thread::sleep(config.poll_interval);
            }
        }
    }

    info!(worker = %config.name, "migration worker stopped");
}
