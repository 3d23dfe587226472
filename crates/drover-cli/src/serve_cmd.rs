//! The `drover serve` command: run the broker.
//!
//! Startup policy: a router bind failure is fatal, an unreachable database
//! is not. When the database cannot be reached the broker starts degraded
//! against the in-memory backend and the connectivity probe promotes the
//! durable backend whenever it comes back.

use std::collections::HashSet;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_core::api::{ApiState, run_api};
use drover_core::broker::{Broker, EVENT_DEPTH};
use drover_core::router::Router;
use drover_store::fallback::FallbackStore;
use drover_store::pg::PgBackend;
use drover_store::pool;

use crate::config::DroverConfig;

pub async fn run_serve(cfg: DroverConfig) -> Result<()> {
    // Durable backend, best-effort. Migrations are normally applied by
    // `drover db-init`; running them here too makes first boot work.
    let durable = match pool::create_pool(&cfg.db_config).await {
        Ok(db_pool) => match pool::run_migrations(&db_pool).await {
            Ok(()) => Some(PgBackend::new(db_pool)),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "migrations failed, starting degraded");
                None
            }
        },
        Err(err) => {
            warn!(error = %format!("{err:#}"), "database unreachable, starting degraded");
            None
        }
    };
    let store = FallbackStore::spawn(durable);

    // Transport. This one is fatal: a broker that agents cannot reach has
    // no reason to exist.
    let (event_tx, event_rx) = mpsc::channel(EVENT_DEPTH);
    let router = Router::bind(&cfg.router_bind, event_tx).await?;

    let api_keys: HashSet<String> = cfg.api_keys.iter().cloned().collect();
    let (broker, broker_handle) =
        Broker::new(router.handle(), event_rx, store.clone(), api_keys);

    let cancel = CancellationToken::new();

    let router_task = tokio::spawn(router.run(cancel.clone()));
    let broker_task = tokio::spawn(broker.run(cancel.clone()));

    let api_state = ApiState {
        store: store.clone(),
        broker: broker_handle,
    };
    let http_bind = cfg.http_bind.clone();
    let api_cancel = cancel.clone();
    let api_task = tokio::spawn(async move { run_api(api_state, &http_bind, api_cancel).await });

    info!("drover serve running; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("shutdown requested");
    cancel.cancel();

    // The broker flushes pending writes on its way out.
    if let Err(err) = broker_task.await {
        error!(error = %err, "broker task panicked");
    }
    if let Err(err) = router_task.await {
        error!(error = %err, "router task panicked");
    }
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %format!("{err:#}"), "monitoring api failed"),
        Err(err) => error!(error = %err, "api task panicked"),
    }
    store.flush().await;

    info!("drover serve shut down");
    Ok(())
}
