//! PostgreSQL backend.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

use crate::backend::Backend;
use crate::models::{
    ClientRecord, LogEntry, NewLogEntry, StoreCounts, Task, TaskStatusUpdate,
};

/// The durable backend: a thin wrapper over a sqlx pool.
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cheap connectivity check used by the fallback layer's probe.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn upsert_client(&self, record: &ClientRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO clients (client_id, identity_hex, hostname, last_seen, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (client_id) DO UPDATE SET \
                 identity_hex = EXCLUDED.identity_hex, \
                 hostname = COALESCE(EXCLUDED.hostname, clients.hostname), \
                 last_seen = EXCLUDED.last_seen, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&record.client_id)
        .bind(&record.identity_hex)
        .bind(&record.hostname)
        .bind(record.last_seen)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert client {}", record.client_id))?;

        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, target, mode, payload, status, created_at, started_at, completed_at, exit_code, failure_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(task.id)
        .bind(&task.target)
        .bind(&task.mode)
        .bind(&task.payload)
        .bind(task.status)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(task.exit_code)
        .bind(&task.failure_reason)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert task {}", task.id))?;

        Ok(())
    }

    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET \
                 status = $2, \
                 started_at = COALESCE($3, started_at), \
                 completed_at = COALESCE($4, completed_at), \
                 exit_code = COALESCE($5, exit_code), \
                 failure_reason = COALESCE($6, failure_reason) \
             WHERE id = $1",
        )
        .bind(update.id)
        .bind(update.status)
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(update.exit_code)
        .bind(&update.failure_reason)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update status of task {}", update.id))?;

        if result.rows_affected() == 0 {
            // The insert may have landed on the other backend during an
            // outage window; the transition itself already happened in the
            // broker, so this is informational.
            warn!(task_id = %update.id, status = %update.status, "status update matched no task row");
        }

        Ok(())
    }

    async fn append_log(&self, entry: &NewLogEntry) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO client_logs (client_id, task_id, msg_id, output, timestamp, log_type) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT ON CONSTRAINT client_logs_dedup DO NOTHING",
        )
        .bind(&entry.client_id)
        .bind(entry.task_id)
        .bind(&entry.msg_id)
        .bind(&entry.output)
        .bind(entry.timestamp)
        .bind(entry.log_type)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "failed to append log for client {} msg {}",
                entry.client_id, entry.msg_id
            )
        })?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let clients = sqlx::query_as::<_, ClientRecord>(
            "SELECT * FROM clients ORDER BY last_seen DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list clients")?;

        Ok(clients)
    }

    async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        // A negative LIMIT is a Postgres error; treat it as zero like the
        // memory backend does.
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context("failed to list tasks")?;

        Ok(tasks)
    }

    async fn get_client_logs(&self, client_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        let logs = sqlx::query_as::<_, LogEntry>(
            "SELECT * FROM client_logs WHERE client_id = $1 \
             ORDER BY timestamp DESC, id DESC LIMIT $2",
        )
        .bind(client_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to get logs for client {client_id}"))?;

        Ok(logs)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let clients: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clients")
            .fetch_one(&self.pool)
            .await
            .context("failed to count clients")?;
        let tasks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tasks")?;

        Ok(StoreCounts { clients, tasks })
    }
}
