//! In-memory fallback backend.
//!
//! Holds the same records as the PostgreSQL backend in plain maps. Lock
//! scopes contain no await points, so a std `RwLock` is sufficient.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::models::{
    ClientRecord, LogEntry, NewLogEntry, StoreCounts, Task, TaskStatusUpdate,
};

#[derive(Default)]
struct MemState {
    clients: HashMap<String, ClientRecord>,
    tasks: HashMap<Uuid, Task>,
    logs: Vec<LogEntry>,
    log_keys: HashSet<(String, Option<Uuid>, String)>,
    next_log_id: i64,
}

/// The ephemeral backend. Contents are lost on restart and are never
/// reconciled back into the durable store.
#[derive(Default)]
pub struct MemBackend {
    state: RwLock<MemState>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn upsert_client(&self, record: &ClientRecord) -> Result<()> {
        let mut state = self.state.write().expect("mem store lock poisoned");
        match state.clients.get_mut(&record.client_id) {
            Some(existing) => {
                existing.identity_hex = record.identity_hex.clone();
                if record.hostname.is_some() {
                    existing.hostname = record.hostname.clone();
                }
                existing.last_seen = record.last_seen;
                existing.updated_at = record.updated_at;
            }
            None => {
                state
                    .clients
                    .insert(record.client_id.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().expect("mem store lock poisoned");
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn update_task_status(&self, update: &TaskStatusUpdate) -> Result<()> {
        let mut state = self.state.write().expect("mem store lock poisoned");
        match state.tasks.get_mut(&update.id) {
            Some(task) => {
                task.status = update.status;
                if update.started_at.is_some() {
                    task.started_at = update.started_at;
                }
                if update.completed_at.is_some() {
                    task.completed_at = update.completed_at;
                }
                if update.exit_code.is_some() {
                    task.exit_code = update.exit_code;
                }
                if update.failure_reason.is_some() {
                    task.failure_reason = update.failure_reason.clone();
                }
            }
            None => {
                debug!(task_id = %update.id, "status update for task unknown to memory backend");
            }
        }
        Ok(())
    }

    async fn append_log(&self, entry: &NewLogEntry) -> Result<bool> {
        let mut state = self.state.write().expect("mem store lock poisoned");
        let key = (
            entry.client_id.clone(),
            entry.task_id,
            entry.msg_id.clone(),
        );
        if !state.log_keys.insert(key) {
            return Ok(false);
        }
        state.next_log_id += 1;
        let id = state.next_log_id;
        state.logs.push(LogEntry {
            id,
            client_id: entry.client_id.clone(),
            task_id: entry.task_id,
            msg_id: entry.msg_id.clone(),
            output: entry.output.clone(),
            timestamp: entry.timestamp,
            log_type: entry.log_type,
        });
        Ok(true)
    }

    async fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        let state = self.state.read().expect("mem store lock poisoned");
        let mut clients: Vec<ClientRecord> = state.clients.values().cloned().collect();
        clients.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(clients)
    }

    async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        let state = self.state.read().expect("mem store lock poisoned");
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn get_client_logs(&self, client_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        let state = self.state.read().expect("mem store lock poisoned");
        let mut logs: Vec<LogEntry> = state
            .logs
            .iter()
            .filter(|e| e.client_id == client_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let state = self.state.read().expect("mem store lock poisoned");
        Ok(StoreCounts {
            clients: state.clients.len() as i64,
            tasks: state.tasks.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogType, TaskStatus};
    use chrono::Utc;

    fn client(id: &str) -> ClientRecord {
        let now = Utc::now();
        ClientRecord {
            client_id: id.to_owned(),
            identity_hex: "0000000000000001".to_owned(),
            hostname: Some("h1".to_owned()),
            last_seen: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn output_entry(client_id: &str, task_id: Uuid, msg_id: &str) -> NewLogEntry {
        NewLogEntry {
            client_id: client_id.to_owned(),
            task_id: Some(task_id),
            msg_id: msg_id.to_owned(),
            output: "file1\n".to_owned(),
            timestamp: Utc::now(),
            log_type: LogType::Output,
        }
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let store = MemBackend::new();
        let first = client("c1");
        store.upsert_client(&first).await.unwrap();

        let mut second = client("c1");
        second.identity_hex = "0000000000000002".to_owned();
        second.created_at = Utc::now();
        store.upsert_client(&second).await.unwrap();

        let clients = store.list_clients().await.unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].created_at, first.created_at);
        assert_eq!(clients[0].identity_hex, "0000000000000002");
    }

    #[tokio::test]
    async fn log_dedup_on_msg_id() {
        let store = MemBackend::new();
        let task_id = Uuid::new_v4();
        let entry = output_entry("c1", task_id, "m1");

        assert!(store.append_log(&entry).await.unwrap());
        assert!(!store.append_log(&entry).await.unwrap());

        let logs = store.get_client_logs("c1", 100).await.unwrap();
        assert_eq!(logs.len(), 1);

        // Same msg_id under a different task is a different delivery.
        let other = output_entry("c1", Uuid::new_v4(), "m1");
        assert!(store.append_log(&other).await.unwrap());
    }

    #[tokio::test]
    async fn tasks_listed_newest_first() {
        let store = MemBackend::new();
        let mut first = Task::new("c1", "shell", "ls");
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        let second = Task::new("c1", "shell", "pwd");
        store.insert_task(&first).await.unwrap();
        store.insert_task(&second).await.unwrap();

        let tasks = store.list_tasks(100).await.unwrap();
        assert_eq!(tasks[0].id, second.id);
        assert_eq!(tasks[1].id, first.id);
    }

    #[tokio::test]
    async fn status_update_applies_partial_fields() {
        let store = MemBackend::new();
        let task = Task::new("c1", "shell", "ls");
        store.insert_task(&task).await.unwrap();

        store
            .update_task_status(&TaskStatusUpdate {
                id: task.id,
                status: TaskStatus::Running,
                started_at: Some(Utc::now()),
                completed_at: None,
                exit_code: None,
                failure_reason: None,
            })
            .await
            .unwrap();

        let tasks = store.list_tasks(10).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Running);
        assert!(tasks[0].started_at.is_some());
        assert!(tasks[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn unknown_task_update_is_ignored() {
        let store = MemBackend::new();
        store
            .update_task_status(&TaskStatusUpdate {
                id: Uuid::new_v4(),
                status: TaskStatus::Running,
                started_at: None,
                completed_at: None,
                exit_code: None,
                failure_reason: None,
            })
            .await
            .unwrap();
        assert_eq!(store.counts().await.unwrap().tasks, 0);
    }
}
