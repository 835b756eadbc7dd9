//! Operator entry points for the migration engine.
//!
//! ```text
//! bgmigrate-admin drain <NAME>            block until no job for NAME is left
//! bgmigrate-admin schedule <NAME> [ARG..] enqueue one job
//! bgmigrate-admin pending <NAME>          print the pending count
//! bgmigrate-admin dead-letters [NAME]     list dead-lettered jobs
//! bgmigrate-admin replay <JOB_ID>         move a dead letter back into the queue
//! bgmigrate-admin work                    run the worker pool until Ctrl-C
//! ```

use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use bgmigrate_core::{ArgValue, ArgumentList, InvalidMigrationName, JobId, MigrationName};
use bgmigrate_infra::EngineConfig;
use bgmigrate_infra::jobs::{
    CompletionTracker, DrainController, JobQueue, MigrationWorker, Scheduler, WorkerStats,
};
use bgmigrate_migrations::{MigrationRegistry, RecordStore};

const DEAD_LETTER_LIMIT: usize = 100;

#[derive(Debug, Parser)]
#[command(name = "bgmigrate-admin")]
#[command(about = "Operate background data migrations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    #[command(about = "Run every remaining job for a migration and wait until none is left")]
    Drain {
        #[arg(value_parser = parse_name)]
        name: MigrationName,
    },
    #[command(about = "Enqueue one job")]
    Schedule {
        #[arg(value_parser = parse_name)]
        name: MigrationName,
        #[arg(
            value_parser = parse_job_arg,
            allow_hyphen_values = true,
            long_help = "Job arguments: integers, true/false and null are typed, anything else is a string"
        )]
        args: Vec<ArgValue>,
    },
    #[command(about = "Print how many jobs for a migration are still queued or running")]
    Pending {
        #[arg(value_parser = parse_name)]
        name: MigrationName,
    },
    #[command(about = "List dead-lettered jobs as JSON lines, oldest first")]
    DeadLetters {
        #[arg(value_parser = parse_name)]
        name: Option<MigrationName>,
    },
    #[command(about = "Move a dead letter back into the queue with a fresh attempt counter")]
    Replay {
        #[arg(value_parser = parse_job_id)]
        id: JobId,
    },
    #[command(about = "Run the worker pool until Ctrl-C")]
    Work,
}

impl Cli {
    /// Parse the arguments following the program name.
    pub fn try_parse_args<I, S>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = std::iter::once("bgmigrate-admin".to_string()).chain(args.into_iter().map(Into::into));
        Self::try_parse_from(argv)
    }
}

fn parse_name(raw: &str) -> Result<MigrationName, InvalidMigrationName> {
    MigrationName::new(raw)
}

fn parse_job_id(raw: &str) -> Result<JobId, <JobId as std::str::FromStr>::Err> {
    raw.parse()
}

fn parse_job_arg(raw: &str) -> Result<ArgValue, Infallible> {
    Ok(parse_arg(raw))
}

/// Interpret a command-line job argument.
///
/// Integers become `Int`, `true`/`false` become `Bool`, `null` becomes
/// `Null`; anything else is passed through as a string.
pub fn parse_arg(raw: &str) -> ArgValue {
    match raw {
        "null" => ArgValue::Null,
        "true" => ArgValue::Bool(true),
        "false" => ArgValue::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(ArgValue::Int)
            .unwrap_or_else(|_| ArgValue::Str(raw.to_string())),
    }
}

/// Wires one queue, store and registry to the operator commands.
pub struct Admin<Q: JobQueue + Clone + 'static> {
    queue: Q,
    store: Arc<dyn RecordStore>,
    registry: Arc<MigrationRegistry>,
    config: EngineConfig,
}

impl<Q: JobQueue + Clone + 'static> Admin<Q> {
    pub fn new(
        queue: Q,
        store: Arc<dyn RecordStore>,
        registry: Arc<MigrationRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            store,
            registry,
            config,
        }
    }

    fn worker(&self) -> MigrationWorker<Q> {
        MigrationWorker::new(self.queue.clone(), self.registry.clone(), self.store.clone())
            .with_retry_policy(self.config.retry.clone())
            .with_lease(self.config.lease)
    }

    /// Run a command, writing its result to `out`.
    ///
    /// `work` blocks until the process receives Ctrl-C.
    pub fn run(&self, command: Command, out: &mut dyn Write) -> anyhow::Result<()> {
        match command {
            Command::Drain { name } => {
                let report = DrainController::new(self.worker(), self.config.drain_config())
                    .drain(&name)
                    .with_context(|| format!("failed to drain {name}"))?;
                writeln!(out, "{}", serde_json::to_string(&report)?)?;
            }
            Command::Schedule { name, args } => {
                let args = ArgumentList::new(args);
                if !self.registry.contains(&name) {
                    tracing::warn!(migration = %name, "no unit registered under this name in this build");
                }
                let id = Scheduler::new(self.queue.clone())
                    .schedule_one(&name, args)
                    .with_context(|| format!("failed to schedule {name}"))?;
                writeln!(out, "{id}")?;
            }
            Command::Pending { name } => {
                let tracker = CompletionTracker::new(self.queue.clone());
                let pending = tracker.count_pending(&name).context("failed to count pending jobs")?;
                writeln!(out, "{pending}")?;
            }
            Command::DeadLetters { name } => {
                let entries = self
                    .queue
                    .list_dead_letters(name.as_ref(), DEAD_LETTER_LIMIT)
                    .context("failed to list dead letters")?;
                for entry in entries {
                    writeln!(out, "{}", serde_json::to_string(&entry)?)?;
                }
            }
            Command::Replay { id } => {
                let job = self
                    .queue
                    .retry_dead_letter(id)
                    .with_context(|| format!("failed to replay {id}"))?;
                writeln!(out, "{} {}", job.id, job.name())?;
            }
            Command::Work => {
                let stats = self.work(wait_for_ctrl_c)?;
                writeln!(out, "{}", serde_json::to_string(&stats)?)?;
            }
        }
        Ok(())
    }

    /// Run the worker pool until `until` returns.
    ///
    /// Workers finish the job in hand before the pool stops, also when
    /// `until` fails.
    pub fn work<F>(&self, until: F) -> anyhow::Result<WorkerStats>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let handle = self
            .worker()
            .spawn(self.config.worker_config())
            .context("failed to start worker threads")?;
        info!(workers = self.config.workers, "worker pool running");

        let waited = until();
        let stats = handle.shutdown();
        info!(processed = stats.jobs_processed, "worker pool stopped");
        waited?;
        Ok(stats)
    }
}

fn wait_for_ctrl_c() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for Ctrl-C")?;
    info!("Ctrl-C received; stopping workers");
    Ok(())
}
