//! Integration tests for the persistence fallback layer: failover to the
//! in-memory backend, probe-driven recovery, and the no-reconciliation
//! policy across the switch point.

use std::time::Duration;

use chrono::Utc;
use sqlx::Executor;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use drover_store::fallback::FallbackStore;
use drover_store::models::{ClientRecord, LogType, NewLogEntry, Task};
use drover_store::pg::PgBackend;
use drover_store::pool;
use drover_test_utils::{drop_test_db, pg_url};

fn client(id: &str, identity: u64) -> ClientRecord {
    let now = Utc::now();
    ClientRecord {
        client_id: id.to_owned(),
        identity_hex: format!("{identity:016x}"),
        hostname: None,
        last_seen: now,
        created_at: now,
        updated_at: now,
    }
}

#[tokio::test]
async fn memory_only_store_serves_reads_and_reports_degraded() {
    let store = FallbackStore::in_memory();

    store.upsert_client(client("c1", 1));
    store.insert_task(Task::new("c1", "shell", "ls"));
    store.append_log(NewLogEntry {
        client_id: "c1".to_owned(),
        task_id: None,
        msg_id: "m1".to_owned(),
        output: "hello".to_owned(),
        timestamp: Utc::now(),
        log_type: LogType::Output,
    });
    store.flush().await;

    let clients = store.list_clients().await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(store.list_tasks(100).await.unwrap().len(), 1);
    assert_eq!(store.get_client_logs("c1", 100).await.unwrap().len(), 1);

    let status = store.get_status().await;
    assert!(status.degraded);
    assert_eq!(status.backend, "memory");
    assert_eq!(status.clients, 1);
    assert_eq!(status.tasks, 1);
}

#[tokio::test]
async fn output_writes_shed_under_backpressure_but_events_never() {
    // Log lane capacity of one; the single-threaded test runtime keeps the
    // writer task parked while this loop runs, so the lane fills at once.
    let store = FallbackStore::spawn_with(None, 1, Duration::from_secs(3600));

    for i in 0..10 {
        store.append_log(NewLogEntry {
            client_id: "c1".to_owned(),
            task_id: None,
            msg_id: format!("m{i}"),
            output: "chunk".to_owned(),
            timestamp: Utc::now(),
            log_type: LogType::Output,
        });
    }
    for i in 0..10 {
        store.append_log(NewLogEntry {
            client_id: "c1".to_owned(),
            task_id: None,
            msg_id: format!("e{i}"),
            output: "event".to_owned(),
            timestamp: Utc::now(),
            log_type: LogType::Event,
        });
    }
    store.flush().await;

    let status = store.get_status().await;
    assert_eq!(status.shed_log_writes, 9, "one output queued, nine shed");

    // All events plus the one queued output survived.
    let logs = store.get_client_logs("c1", 100).await.unwrap();
    assert_eq!(logs.len(), 11);
    assert_eq!(
        logs.iter().filter(|l| l.log_type == LogType::Event).count(),
        10
    );
}

#[tokio::test]
async fn unreachable_durable_backend_fails_over_on_first_write() {
    // Nothing listens on this address; the pool connects lazily so the
    // failure surfaces at first use.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(300))
        .connect_lazy("postgresql://127.0.0.1:1/drover")
        .expect("lazy pool construction should not fail");
    let store = FallbackStore::spawn_with(
        Some(PgBackend::new(pool)),
        64,
        Duration::from_secs(3600), // probe out of the way, demotion comes from the write
    );
    assert!(store.is_durable_active());

    store.upsert_client(client("c1", 1));
    store.flush().await;

    // The failed write demoted the durable backend and landed in memory.
    assert!(!store.is_durable_active());
    let clients = store.list_clients().await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_id, "c1");
    assert!(store.get_status().await.degraded);
}

#[tokio::test]
async fn probe_recovers_durable_backend_without_migrating_outage_data() {
    let base_url = pg_url().await;
    let db_name = format!("drover_test_{}", Uuid::new_v4().simple());
    let db_url = format!("{base_url}/{db_name}");

    // The database does not exist yet, so every durable operation fails.
    let lazy_pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(2))
        .connect_lazy(&db_url)
        .expect("lazy pool construction should not fail");
    let store = FallbackStore::spawn_with(
        Some(PgBackend::new(lazy_pool)),
        64,
        Duration::from_millis(100),
    );

    // Outage-window write: lands in memory.
    store.upsert_client(client("c1", 1));
    store.flush().await;
    assert!(!store.is_durable_active());
    assert_eq!(store.list_clients().await.unwrap().len(), 1);

    // Bring the durable backend up.
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to maintenance database");
    maint_pool
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .expect("failed to create database");
    maint_pool.close().await;

    let migrate_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .expect("failed to connect for migrations");
    pool::run_migrations(&migrate_pool)
        .await
        .expect("migrations should succeed");

    // Wait for the probe to notice.
    let mut recovered = false;
    for _ in 0..50 {
        if store.is_durable_active() {
            recovered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(recovered, "probe should promote the durable backend");

    // Post-recovery write lands durably.
    store.upsert_client(client("c2", 2));
    store.flush().await;

    let durable_clients: Vec<(String,)> =
        sqlx::query_as("SELECT client_id FROM clients ORDER BY client_id")
            .fetch_all(&migrate_pool)
            .await
            .expect("failed to query clients");
    let ids: Vec<&str> = durable_clients.iter().map(|(id,)| id.as_str()).collect();

    // c2 is durable; the outage-window c1 stays behind in memory.
    assert!(ids.contains(&"c2"));
    assert!(!ids.contains(&"c1"));

    assert!(!store.get_status().await.degraded);

    migrate_pool.close().await;
    drop_test_db(&db_name).await;
}
