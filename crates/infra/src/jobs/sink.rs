//! Where terminal failures are reported.
//!
//! Migrations run out of band, so a dead-lettered job never surfaces as an
//! error to whoever scheduled it. Operators find out through a sink.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::error;

use bgmigrate_core::{JobId, MigrationName};

use super::types::DeadLetterEntry;

pub trait FailureSink: Send + Sync {
    fn job_dead_lettered(&self, entry: &DeadLetterEntry);

    /// A stored job could not be decoded and was dead-lettered by the queue.
    fn job_undecodable(&self, id: JobId, reason: &str) {
        error!(job_id = %id, reason = %reason, "undecodable migration job dead-lettered");
    }
}

/// Logs every terminal failure at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFailureSink;

impl FailureSink for TracingFailureSink {
    fn job_dead_lettered(&self, entry: &DeadLetterEntry) {
        error!(
            job_id = %entry.job.id,
            migration = %entry.job.name(),
            attempts = entry.job.attempt,
            args = %serde_json::to_string(&entry.job.payload.args).unwrap_or_default(),
            reason = %entry.reason,
            "migration job dead-lettered"
        );
    }
}

/// Keeps per-migration failure counts in memory (and logs like
/// [`TracingFailureSink`]).
#[derive(Debug, Default)]
pub struct CountingFailureSink {
    counts: Mutex<HashMap<MigrationName, usize>>,
    undecodable: Mutex<Vec<JobId>>,
}

impl CountingFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &MigrationName) -> usize {
        self.counts
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.lock().map(|c| c.values().sum()).unwrap_or(0)
    }

    /// Jobs reported as undecodable, in report order.
    pub fn undecodable(&self) -> Vec<JobId> {
        self.undecodable.lock().map(|ids| ids.clone()).unwrap_or_default()
    }
}

impl FailureSink for CountingFailureSink {
    fn job_dead_lettered(&self, entry: &DeadLetterEntry) {
        TracingFailureSink.job_dead_lettered(entry);
        if let Ok(mut counts) = self.counts.lock() {
            *counts.entry(entry.job.name().clone()).or_default() += 1;
        }
    }

    fn job_undecodable(&self, id: JobId, reason: &str) {
        TracingFailureSink.job_undecodable(id, reason);
        if let Ok(mut ids) = self.undecodable.lock() {
            ids.push(id);
        }
    }
}
