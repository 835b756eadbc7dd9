use std::io;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use bgmigrate_admin::{Admin, Cli};
use bgmigrate_infra::jobs::PostgresJobQueue;
use bgmigrate_infra::storage::PostgresRecordStore;
use bgmigrate_infra::{Database, EngineConfig};
use bgmigrate_migrations::MigrationRegistry;

fn main() -> anyhow::Result<()> {
    bgmigrate_observability::init();

    let cli = Cli::parse();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let db = Database::connect(config.database_url()?, config.max_connections)
        .context("failed to open database")?;

    let queue = PostgresJobQueue::new(db.clone());
    queue
        .ensure_schema()
        .context("failed to create migration job tables")?;
    let store = Arc::new(PostgresRecordStore::new(db));
    let registry = MigrationRegistry::standard().context("failed to build migration registry")?;

    let admin = Admin::new(queue, store, Arc::new(registry), config);
    admin.run(cli.command, &mut io::stdout().lock())
}
