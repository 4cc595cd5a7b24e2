//! Connection pool and embedded migrations

use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::StoreResult;

/// Migrations under the workspace `migrations/` directory.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn create_pool(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool established"
    );
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    MIGRATOR.run(pool).await?;
    info!("Database migrations completed");
    Ok(())
}

/// Pool plus migrations when `run_migrations` is set.
pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = create_pool(config).await?;
    if config.run_migrations {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}
