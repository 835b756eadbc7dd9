//! Migration error model.

use thiserror::Error;

use crate::name::MigrationName;

/// Result type returned by migration units and the runtime around them.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Failure of a single migration run.
///
/// Only failures the *runtime* has to classify live here. A record that
/// vanished before execution, or source data that cannot be parsed, is resolved
/// inside the unit itself and reported as success.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// Infrastructure was temporarily unavailable (retry with backoff).
    #[error("transient failure: {0}")]
    Transient(String),

    /// No unit is registered under the job's name.
    #[error("no migration registered as `{0}`")]
    Unresolvable(MigrationName),

    /// The job's arguments do not match the unit's argument contract.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The unit declared the job impossible to complete.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl MigrationError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::InvalidArguments(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Whether a retry could possibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
