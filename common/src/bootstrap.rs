// Bootstrap utilities for binary initialization

use crate::config::Settings;
use crate::db::DbPool;
use anyhow::{Context, Result};
use tracing::info;

/// Initialize database pool
/// Used by: API server, Worker
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Create the batch data directories if they do not exist
/// Used by: API server, Worker
#[tracing::instrument(skip(settings))]
pub async fn init_data_dirs(settings: &Settings) -> Result<()> {
    for dir in [settings.storage.input_dir(), settings.storage.output_dir()] {
        if !dir.exists() {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
            info!(path = %dir.display(), "Created data directory");
        }
    }
    Ok(())
}

/// Initialize tracing for JSON logging
/// Used by: Worker
pub fn init_json_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .json()
        .init();
}

/// Initialize tracing for human-readable logging
/// Used by: API server (development)
pub fn init_human_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "api=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
