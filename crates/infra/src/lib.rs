//! Infrastructure for the migration engine: job queue, workers, draining,
//! Postgres adapters and configuration.

pub mod config;
pub mod db;
pub mod jobs;
pub mod storage;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, EngineConfig};
pub use db::{Database, DbError};
