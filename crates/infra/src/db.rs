//! Postgres connection pool plus the runtime that drives it.
//!
//! The engine's queue and store traits are synchronous (workers are plain
//! threads), so every adapter runs its `sqlx` futures through
//! [`Database::block_on`]. Never call it from inside an async context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::{Builder, Runtime};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to start database runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),
}

/// Cheap to clone; clones share the pool and the runtime.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    runtime: Arc<Runtime>,
}

impl Database {
    pub fn connect(url: &str, max_connections: u32) -> Result<Self, DbError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bgmigrate-db")
            .enable_all()
            .build()?;

        let pool = runtime.block_on(
            PgPoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .connect(url),
        )?;

        info!(max_connections, "connected to postgres");
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
