//! PostgreSQL fixtures for integration tests.
//!
//! One server is shared per test binary; every test works in a database of
//! its own, so tests never see each other's rows. The server is either an
//! external instance named by `DROVER_TEST_PG_URL` (useful under nextest,
//! where a setup script can start one container for the whole run) or a
//! testcontainers Postgres started lazily on first use.

use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use drover_store::config::DbConfig;
use drover_store::pool;

struct PgServer {
    base_url: String,
    /// Keeps the container running for the life of the test binary.
    _container: Option<ContainerAsync<Postgres>>,
}

static PG_SERVER: OnceCell<PgServer> = OnceCell::const_new();

async fn start_server() -> PgServer {
    if let Ok(base_url) = std::env::var("DROVER_TEST_PG_URL") {
        return PgServer {
            base_url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("postgres container did not start");
    let host = container.get_host().await.expect("container has no host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("container exposed no port 5432");

    PgServer {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

/// Server-root URL (no database path) of the shared PostgreSQL.
pub async fn pg_url() -> &'static str {
    &PG_SERVER.get_or_init(start_server).await.base_url
}

/// Fresh, migrated database on the shared server.
///
/// Returns the pool and the generated database name; hand the name to
/// [`drop_test_db`] when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let db_name = format!("drover_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{}/{db_name}", pg_url().await));

    pool::ensure_database_exists(&config)
        .await
        .expect("test database creation failed");
    let db_pool = pool::create_pool(&config)
        .await
        .expect("could not connect to the test database");
    pool::run_migrations(&db_pool)
        .await
        .expect("test database migration failed");

    (db_pool, db_name)
}

/// Remove a test database, kicking out any connection still attached to it.
/// Safe to call for a database that is already gone.
pub async fn drop_test_db(db_name: &str) {
    let config = DbConfig::new(format!("{}/{db_name}", pg_url().await));
    let Ok(maint) = pool::create_pool(&DbConfig::new(config.maintenance_url())).await else {
        return;
    };

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint.execute(terminate.as_str()).await;
    let _ = maint
        .execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str())
        .await;
    maint.close().await;
}
