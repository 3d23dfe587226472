//! Pool construction and schema management for the durable backend.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Schema migrations compiled into the binary from
/// `crates/drover-store/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const POOL_SIZE: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Open a pool against the configured database.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(POOL_SIZE)
        .acquire_timeout(CONNECT_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("could not open a pool to {}", config.database_url))
}

/// Bring the schema up to date.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("migration run failed")?;
    info!("schema is up to date");
    Ok(())
}

/// Create the target database when it is missing.
///
/// Issued through [`DbConfig::maintenance_url`]; already-existing databases
/// are left untouched.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let Some(name) = config.database_name() else {
        bail!("database URL {:?} names no database", config.database_url);
    };
    // CREATE DATABASE takes no bind parameters; restrict the name instead.
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("refusing to create a database named {name:?}");
    }

    let maint = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(CONNECT_TIMEOUT)
        .connect(&config.maintenance_url())
        .await
        .with_context(|| format!("could not reach the maintenance database for {name}"))?;

    let already: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(name)
            .fetch_one(&maint)
            .await
            .context("pg_database lookup failed")?;

    if already {
        info!(db = name, "database already present");
    } else {
        maint
            .execute(format!("CREATE DATABASE {name}").as_str())
            .await
            .with_context(|| format!("CREATE DATABASE {name} failed"))?;
        info!(db = name, "database created");
    }

    maint.close().await;
    Ok(())
}
