use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;

use crate::config::Settings;

pub type PgPool = Pool;

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Create a connection pool from the configured database URL.
pub fn create_pool(settings: &Settings) -> Result<PgPool> {
    let pg_config = settings
        .database
        .url
        .parse::<tokio_postgres::Config>()
        .with_context(|| "Invalid database URL")?;

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = Manager::from_config(pg_config, NoTls, mgr_config);

    let pool = Pool::builder(manager)
        .max_size(settings.database.pool_size)
        .build()
        .with_context(|| "Failed to build connection pool")?;

    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut client = pool.get().await?;

    let report = embedded::migrations::runner()
        .run_async(&mut **client)
        .await
        .with_context(|| "Failed to run database migrations")?;

    for migration in report.applied_migrations() {
        log::info!("Applied migration: {migration}");
    }

    Ok(())
}
