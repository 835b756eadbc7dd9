//! `bgmigrate-core`: shared vocabulary of the migration engine.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, migration names, job arguments and the error taxonomy that the
//! runtime uses to classify failures.

pub mod args;
pub mod error;
pub mod id;
pub mod name;

pub use args::{ArgValue, ArgumentList, JobPayload};
pub use error::{MigrationError, MigrationResult};
pub use id::{JobId, RecordId};
pub use name::{InvalidMigrationName, MigrationName};
