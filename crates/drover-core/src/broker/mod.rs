//! The dispatch core: one loop, one owner of all protocol state.
//!
//! The broker consumes two channels (transport events from the router,
//! commands from the monitoring API) and is the only context that touches
//! the registry and the task store. Processing frames one at a time is the
//! system's correctness mechanism; nothing here needs a lock.
//!
//! Persistence is mirrored through the fallback store and never awaited on
//! the hot path.

use std::collections::HashSet;

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use drover_proto::{self as proto, Message};
use drover_store::fallback::FallbackStore;
use drover_store::models::{LogType, NewLogEntry, Task};

use crate::registry::Registry;
use crate::router::{Identity, RouterEvent, RouterHandle, SendError};
use crate::state::{TaskStore, Transition};

/// Depth of the broker's command channel (API → broker).
pub const COMMAND_DEPTH: usize = 64;

/// Depth of the router event channel (transport → broker).
pub const EVENT_DEPTH: usize = 1024;

/// Task submission failure, reported to the external caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The target has no live identity right now. Tasks are not queued for
    /// offline clients.
    #[error("no connected client with id {0:?}")]
    UnknownClient(String),
    /// The broker loop is gone (shutdown).
    #[error("broker unavailable")]
    Unavailable,
}

/// Commands from concurrent contexts (the monitoring API). All mutations
/// still execute inside the broker loop.
pub enum Command {
    Submit {
        target: String,
        mode: String,
        payload: String,
        reply: oneshot::Sender<Result<Task, SubmitError>>,
    },
}

/// Cloneable handle used by the API to reach the broker loop.
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    /// Submit a task for a connected client and dispatch it immediately.
    ///
    /// The returned task reflects the state after the dispatch attempt: it
    /// is `Queued` when the assign frame was handed to the transport, or
    /// already `Failed` when it could not be (most commonly the target's
    /// identity went stale in between).
    pub async fn submit(
        &self,
        target: impl Into<String>,
        mode: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<Task, SubmitError> {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Submit {
            target: target.into(),
            mode: mode.into(),
            payload: payload.into(),
            reply,
        };
        self.tx.send(cmd).await.map_err(|_| SubmitError::Unavailable)?;
        rx.await.map_err(|_| SubmitError::Unavailable)?
    }
}

/// The broker loop state.
pub struct Broker {
    router: RouterHandle,
    events: mpsc::Receiver<RouterEvent>,
    commands: mpsc::Receiver<Command>,
    registry: Registry,
    tasks: TaskStore,
    store: FallbackStore,
    api_keys: HashSet<String>,
}

impl Broker {
    /// Build a broker plus the handle for external submitters.
    ///
    /// `events` is the receiving end of the channel given to
    /// [`crate::router::Router::bind`].
    pub fn new(
        router: RouterHandle,
        events: mpsc::Receiver<RouterEvent>,
        store: FallbackStore,
        api_keys: HashSet<String>,
    ) -> (Self, BrokerHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_DEPTH);
        let broker = Self {
            router,
            events,
            commands,
            registry: Registry::new(),
            tasks: TaskStore::new(),
            store,
            api_keys,
        };
        (broker, BrokerHandle { tx })
    }

    /// Run until cancelled or both input channels close.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("broker loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(RouterEvent::Frame { identity, payload }) => {
                        self.handle_frame(identity, &payload);
                    }
                    Some(RouterEvent::Disconnected { identity }) => {
                        if let Some(client_id) = self.registry.unbind(identity) {
                            debug!(%identity, %client_id, "client disconnected");
                        }
                    }
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Submit { target, mode, payload, reply }) => {
                        let result = self.submit(&target, &mode, &payload);
                        let _ = reply.send(result);
                    }
                    None => break,
                },
            }
        }
        self.store.flush().await;
        info!("broker loop stopped");
    }

    // -- inbound protocol ---------------------------------------------------

    fn handle_frame(&mut self, identity: Identity, payload: &[u8]) {
        let msg = match proto::decode(payload) {
            Ok(msg) => msg,
            Err(err) => {
                // Per-message fault: drop, log, leave the connection alone.
                warn!(%identity, error = %err, "dropping undecodable message");
                return;
            }
        };

        debug!(%identity, kind = msg.kind(), "frame received");

        match &msg {
            Message::Hello {
                client_id,
                api_key,
                hostname,
            } => self.handle_hello(identity, client_id, api_key, hostname.as_deref()),
            Message::TaskStarted { task } => self.handle_task_started(identity, *task, &msg),
            Message::Output {
                task,
                chunk,
                msg_id,
                ts,
            } => self.handle_output(identity, *task, chunk, msg_id, *ts, &msg),
            Message::Completed {
                task,
                exit_code,
                ts,
            } => self.handle_completed(identity, *task, *exit_code, *ts, &msg),
            Message::Assign { .. } | Message::Ack { .. } | Message::Reject { .. } => {
                warn!(%identity, kind = msg.kind(), "server-only message from agent, dropping");
            }
        }
    }

    fn handle_hello(
        &mut self,
        identity: Identity,
        client_id: &str,
        api_key: &str,
        hostname: Option<&str>,
    ) {
        let outcome = match self
            .registry
            .register(identity, client_id, api_key, hostname, &self.api_keys)
        {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%identity, client_id, error = %err, "registration refused");
                self.send(
                    identity,
                    &Message::Reject {
                        reason: err.to_string(),
                    },
                );
                return;
            }
        };

        if outcome.is_new {
            info!(client_id, %identity, "registered new client");
        } else {
            info!(
                client_id,
                %identity,
                superseded = ?outcome.superseded,
                "client reconnected"
            );
        }

        self.store.upsert_client(outcome.record);
        self.store.append_log(NewLogEntry::event(
            client_id,
            None,
            format!(
                "authenticated identity={} hostname={}",
                identity,
                hostname.unwrap_or("-")
            ),
        ));

        self.send(
            identity,
            &Message::Ack {
                ack_for: "hello".to_owned(),
                task: None,
                ts: Some(Utc::now()),
            },
        );
    }

    /// Resolve and touch the sender, then check task ownership. Returns the
    /// sender's client_id, or `None` when the message must be dropped (all
    /// drop cases are logged here).
    fn attribute(&mut self, identity: Identity, task: Uuid, msg: &Message) -> Option<String> {
        let kind = msg.kind();
        let Some(client_id) = self.registry.resolve(identity).map(str::to_owned) else {
            warn!(%identity, kind, "message from unregistered identity, dropping");
            return None;
        };
        self.registry.touch(&client_id);

        let Some(known) = self.tasks.get(&task) else {
            info!(%client_id, task_id = %task, kind, "notification for unknown task, ignoring");
            return None;
        };
        let target = known.target.clone();
        if let Err(err) = proto::validate(msg, &client_id, Some(target.as_str())) {
            warn!(%client_id, task_id = %task, error = %err, "ownership validation failed, dropping");
            return None;
        }
        Some(client_id)
    }

    fn handle_task_started(&mut self, identity: Identity, task: Uuid, msg: &Message) {
        let Some(client_id) = self.attribute(identity, task, msg) else {
            return;
        };

        match self.tasks.start(task) {
            Transition::Applied(update) => {
                info!(%client_id, task_id = %task, "task started");
                self.store.update_task_status(update);
            }
            Transition::Ignored { status } => {
                debug!(%client_id, task_id = %task, %status, "duplicate task_started ignored");
            }
            Transition::UnknownTask => unreachable!("attribute() checked the task exists"),
        }

        self.send(
            identity,
            &Message::Ack {
                ack_for: task.to_string(),
                task: Some(task),
                ts: None,
            },
        );
    }

    fn handle_output(
        &mut self,
        identity: Identity,
        task: Uuid,
        chunk: &str,
        msg_id: &str,
        ts: chrono::DateTime<Utc>,
        msg: &Message,
    ) {
        let Some(client_id) = self.attribute(identity, task, msg) else {
            return;
        };

        // Dedup on (client_id, task_id, msg_id) happens in the store;
        // output never changes task status.
        self.store.append_log(NewLogEntry {
            client_id,
            task_id: Some(task),
            msg_id: msg_id.to_owned(),
            output: chunk.to_owned(),
            timestamp: ts,
            log_type: LogType::Output,
        });

        self.send(
            identity,
            &Message::Ack {
                ack_for: msg_id.to_owned(),
                task: Some(task),
                ts: Some(Utc::now()),
            },
        );
    }

    fn handle_completed(
        &mut self,
        identity: Identity,
        task: Uuid,
        exit_code: i32,
        ts: chrono::DateTime<Utc>,
        msg: &Message,
    ) {
        let Some(client_id) = self.attribute(identity, task, msg) else {
            return;
        };

        match self.tasks.complete(task, exit_code, ts) {
            Transition::Applied(update) => {
                let status = update.status;
                info!(%client_id, task_id = %task, exit_code, %status, "task completed");
                self.store.update_task_status(update);
                self.store.append_log(NewLogEntry::event(
                    &client_id,
                    Some(task),
                    format!("task_completed exit_code={exit_code} status={status}"),
                ));
            }
            Transition::Ignored { status } => {
                debug!(%client_id, task_id = %task, %status, "duplicate completed ignored");
            }
            Transition::UnknownTask => unreachable!("attribute() checked the task exists"),
        }

        self.send(
            identity,
            &Message::Ack {
                ack_for: format!("completed:{task}"),
                task: Some(task),
                ts: Some(Utc::now()),
            },
        );
    }

    // -- task submission ----------------------------------------------------

    /// Create a Queued task for a connected target and dispatch it.
    fn submit(&mut self, target: &str, mode: &str, payload: &str) -> Result<Task, SubmitError> {
        let Some(identity) = self.registry.identity_of(target) else {
            return Err(SubmitError::UnknownClient(target.to_owned()));
        };

        let task = self.tasks.create(target, mode, payload);
        self.store.insert_task(task.clone());
        info!(task_id = %task.id, target, mode, "task submitted");

        self.dispatch(task, identity)
    }

    /// Encode the assign frame and push it to the target's identity.
    ///
    /// Any frame that cannot be handed to the transport fails the task on
    /// the spot, whatever the cause: a stale identity, a full outbound
    /// buffer, or an encode failure. There is no redelivery queue, so a
    /// task left `Queued` with no assign in flight would sit forever. The
    /// failure_reason records which of the three it was.
    fn dispatch(&mut self, task: Task, identity: Identity) -> Result<Task, SubmitError> {
        let assign = Message::Assign {
            id: task.id,
            mode: task.mode.clone(),
            payload: task.payload.clone(),
        };

        let send_result = match proto::encode(&assign) {
            Ok(bytes) => self
                .router
                .send(identity, Bytes::from(bytes))
                .map_err(|err| err.to_string()),
            Err(err) => Err(format!("encode failed: {err}")),
        };

        match send_result {
            Ok(()) => {
                debug!(task_id = %task.id, %identity, "assign dispatched");
                Ok(task)
            }
            Err(reason) => {
                warn!(task_id = %task.id, %identity, %reason, "dispatch failed, failing task");
                if let Transition::Applied(update) = self.tasks.fail_dispatch(task.id, &reason) {
                    self.store.update_task_status(update);
                }
                // Report the post-failure state to the caller.
                Ok(self
                    .tasks
                    .get(&task.id)
                    .cloned()
                    .unwrap_or(task))
            }
        }
    }

    // -- outbound -----------------------------------------------------------

    /// Fire-and-forget send; failures are logged and otherwise ignored
    /// (acks and rejects are best-effort).
    fn send(&self, identity: Identity, msg: &Message) {
        let bytes = match proto::encode(msg) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(kind = msg.kind(), error = %err, "failed to encode outbound message");
                return;
            }
        };
        match self.router.send(identity, Bytes::from(bytes)) {
            Ok(()) => {}
            Err(SendError::StaleIdentity(_)) => {
                debug!(%identity, kind = msg.kind(), "outbound message to stale identity dropped");
            }
            Err(SendError::Backpressure(_)) => {
                debug!(%identity, kind = msg.kind(), "outbound buffer full, message dropped");
            }
        }
    }
}
