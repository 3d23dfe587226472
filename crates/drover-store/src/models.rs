use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and Failed are terminal: no further transition is accepted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of a client log entry: streamed task output or a broker event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Output,
    Event,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Output => "output",
            Self::Event => "event",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A registered client. `client_id` is the stable application-level name;
/// `identity_hex` is the transport identity of the most recent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ClientRecord {
    pub client_id: String,
    pub identity_hex: String,
    pub hostname: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task record. Terminal tasks carry an `exit_code`; tasks failed by the
/// broker itself (stale identity at dispatch) carry a `failure_reason`
/// instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub target: String,
    pub mode: String,
    pub payload: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

impl Task {
    /// Build a fresh Queued task.
    pub fn new(target: impl Into<String>, mode: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.into(),
            mode: mode.into(),
            payload: payload.into(),
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure_reason: None,
        }
    }
}

/// Partial update mirroring an accepted task state transition. `None`
/// fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdate {
    pub id: Uuid,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

/// A stored client log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LogEntry {
    pub id: i64,
    pub client_id: String,
    pub task_id: Option<Uuid>,
    pub msg_id: String,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
}

/// Parameters for appending a log entry. `(client_id, task_id, msg_id)` is
/// the dedup key: appending the same tuple twice stores exactly one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub client_id: String,
    pub task_id: Option<Uuid>,
    pub msg_id: String,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
}

impl NewLogEntry {
    /// An `event`-type entry (registration, completion, broker faults).
    pub fn event(client_id: impl Into<String>, task_id: Option<Uuid>, text: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            task_id,
            msg_id: Uuid::new_v4().to_string(),
            output: text.into(),
            timestamp: Utc::now(),
            log_type: LogType::Event,
        }
    }
}

/// Row counts reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub clients: i64,
    pub tasks: i64,
}

/// Snapshot served by `GET /api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Name of the backend currently taking writes: "postgres" or "memory".
    pub backend: &'static str,
    /// True while the durable backend is unreachable (or not configured).
    pub degraded: bool,
    pub clients: i64,
    pub tasks: i64,
    /// Output-log writes dropped under backpressure since startup.
    pub shed_log_writes: u64,
}
