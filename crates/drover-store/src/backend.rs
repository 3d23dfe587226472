//! The backend interface shared by the durable and in-memory stores.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ClientRecord, LogEntry, NewLogEntry, StoreCounts, Task, TaskStatusUpdate,
};

/// Operations a storage backend must support. The fallback layer uses both
/// implementations through this trait and routes each call to whichever is
/// currently active.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Insert or update a client record, preserving `created_at` on update.
    async fn upsert_client(&self, record: &ClientRecord) -> Result<()>;

    /// Insert a freshly submitted task.
    async fn insert_task(&self, task: &Task) -> Result<()>;

    /// Apply a task status transition. Unknown task ids are logged and
    /// ignored: during a failover window the active backend may legitimately
    /// have never seen the insert.
    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<()>;

    /// Append a log entry. Returns `false` when the entry was a duplicate
    /// of an already-stored `(client_id, task_id, msg_id)` tuple.
    async fn append_log(&self, entry: &NewLogEntry) -> Result<bool>;

    /// All clients, most recently seen first.
    async fn list_clients(&self) -> Result<Vec<ClientRecord>>;

    /// Tasks, newest first, up to `limit`.
    async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>>;

    /// Logs for one client, newest first, up to `limit`.
    async fn get_client_logs(&self, client_id: &str, limit: i64) -> Result<Vec<LogEntry>>;

    /// Client and task row counts.
    async fn counts(&self) -> Result<StoreCounts>;
}
