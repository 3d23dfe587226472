//! Wire protocol for the drover broker: message codec and validator.
//!
//! Every frame payload is a JSON document with a mandatory `type`
//! discriminator. The protocol is asynchronous: nothing here is
//! request/response, an agent fires a message and may (or may not) receive
//! further messages later. Extending the protocol means adding a [`Message`]
//! variant and a handler arm in the broker, never touching the codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted length of a `client_id`.
pub const MAX_CLIENT_ID_LEN: usize = 120;

/// A protocol message, tagged by the wire `type` field.
///
/// `Hello`, `TaskStarted`, `Output`, and `Completed` arrive from agents;
/// `Assign`, `Ack`, and `Reject` are only ever sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Agent registration. Presents the shared secret and the stable
    /// application-level client id.
    Hello {
        client_id: String,
        api_key: String,
        #[serde(default)]
        hostname: Option<String>,
    },
    /// Agent picked up a previously assigned task.
    TaskStarted { task: Uuid },
    /// A chunk of task output. `msg_id` identifies the delivery attempt so
    /// at-least-once redelivery can be deduplicated.
    Output {
        task: Uuid,
        chunk: String,
        msg_id: String,
        ts: DateTime<Utc>,
    },
    /// Task finished with the given exit code.
    Completed {
        task: Uuid,
        exit_code: i32,
        ts: DateTime<Utc>,
    },
    /// Server-to-agent task assignment.
    Assign {
        id: Uuid,
        mode: String,
        payload: String,
    },
    /// Server acknowledgement of an inbound message.
    Ack {
        ack_for: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts: Option<DateTime<Utc>>,
    },
    /// Server refusal of a registration attempt.
    Reject { reason: String },
}

impl Message {
    /// Wire name of the `type` discriminator for this variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::TaskStarted { .. } => "task_started",
            Self::Output { .. } => "output",
            Self::Completed { .. } => "completed",
            Self::Assign { .. } => "assign",
            Self::Ack { .. } => "ack",
            Self::Reject { .. } => "reject",
        }
    }

    /// The task this message references, if any.
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Self::TaskStarted { task }
            | Self::Output { task, .. }
            | Self::Completed { task, .. } => Some(*task),
            Self::Assign { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// All recognized `type` discriminator values.
const KNOWN_TYPES: &[&str] = &[
    "hello",
    "task_started",
    "output",
    "completed",
    "assign",
    "ack",
    "reject",
];

/// Error decoding a frame payload into a [`Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not valid JSON.
    #[error("malformed message encoding")]
    Malformed(#[source] serde_json::Error),
    /// The payload has no string `type` field.
    #[error("message has no type discriminator")]
    MissingType,
    /// The `type` field names no recognized variant. The broker drops the
    /// single message and logs it; the connection is left alone.
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    /// The `type` is recognized but a required field is missing or has the
    /// wrong shape.
    #[error("invalid fields for {kind:?} message")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Referential validation failure for an otherwise well-formed message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The message references a task whose target is a different client.
    #[error("task {task} belongs to {target:?}, not sender {sender:?}")]
    ForeignTask {
        task: Uuid,
        target: String,
        sender: String,
    },
    /// The hello carries an empty or ill-formed client id.
    #[error("malformed client id {0:?}")]
    MalformedClientId(String),
}

/// Decode a frame payload.
pub fn decode(raw: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(raw).map_err(DecodeError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    if !KNOWN_TYPES.contains(&kind) {
        return Err(DecodeError::UnknownType(kind.to_owned()));
    }
    let kind = kind.to_owned();
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { kind, source })
}

/// Encode a message to its frame payload. Exact inverse of [`decode`].
pub fn encode(msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Check a `client_id` against the accepted shape: non-empty, at most
/// [`MAX_CLIENT_ID_LEN`] characters, alphanumeric plus `-` and `_`.
pub fn is_well_formed_client_id(client_id: &str) -> bool {
    !client_id.is_empty()
        && client_id.len() <= MAX_CLIENT_ID_LEN
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a decoded message against its sender.
///
/// `task_target` is the `target` client of the task the message references,
/// as resolved by the caller; pass `None` for messages that reference no
/// task (the caller handles unknown task ids itself, as a logged no-op).
pub fn validate(
    msg: &Message,
    sender_client_id: &str,
    task_target: Option<&str>,
) -> Result<(), ValidationError> {
    match msg {
        Message::Hello { client_id, .. } => {
            if !is_well_formed_client_id(client_id) {
                return Err(ValidationError::MalformedClientId(client_id.clone()));
            }
            Ok(())
        }
        Message::TaskStarted { task }
        | Message::Output { task, .. }
        | Message::Completed { task, .. } => match task_target {
            Some(target) if target != sender_client_id => Err(ValidationError::ForeignTask {
                task: *task,
                target: target.to_owned(),
                sender: sender_client_id.to_owned(),
            }),
            _ => Ok(()),
        },
        Message::Assign { .. } | Message::Ack { .. } | Message::Reject { .. } => Ok(()),
    }
}
