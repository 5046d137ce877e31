//! CLI command implementations.

use anyhow::{Context, Result};
use berth_config::{WorkerConfig, load_worker_config};
use berth_db::{PgWorkerResourceRepo, WorkerResourceRepo, create_pool, run_migrations};
use tracing::info;

fn load(path: &str) -> Result<WorkerConfig> {
    load_worker_config(path).with_context(|| format!("invalid worker configuration {}", path))
}

pub fn check_config(path: &str) -> Result<()> {
    let config = load(path)?;
    println!(
        "Configuration is valid: worker {} with {} resource type(s)",
        config.info.name,
        config.info.resource_types.len()
    );
    Ok(())
}

pub async fn migrate(database_url: &str) -> Result<()> {
    let pool = create_pool(database_url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool).await.context("failed to run migrations")?;
    info!("Migrations applied");
    Ok(())
}

pub async fn register(path: &str, database_url: &str) -> Result<()> {
    let config = load(path)?;
    let pool = create_pool(database_url)
        .await
        .context("failed to connect to database")?;

    PgWorkerResourceRepo::new(pool)
        .save_worker_resources(&config.info)
        .await
        .context("failed to save worker resources")?;
    info!(
        worker = %config.info.name,
        resource_types = config.info.resource_types.len(),
        certs = config.info.certs_path.is_some(),
        "Registered worker"
    );
    Ok(())
}
