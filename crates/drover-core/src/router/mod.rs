//! The router transport: one TCP listener multiplexing many agent
//! connections, each addressable by an opaque [`Identity`].
//!
//! Every accepted connection gets a fresh identity and a length-delimited
//! framed stream. Inbound frames are forwarded to the broker as
//! `(identity, payload)` pairs; outbound frames are routed through a table
//! of per-connection senders. An identity is valid only for the lifetime of
//! one connection: once the peer goes away (or is superseded), sends to it
//! fail with [`SendError::StaleIdentity`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound frames buffered per connection before a send fails.
const OUTBOUND_DEPTH: usize = 256;

/// Opaque transport handle for one live connection.
///
/// Distinct from `client_id`: identities are minted per connection and die
/// with it, while `client_id` is the stable application-level name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity(u64);

impl Identity {
    /// Build an identity from its raw counter value. Outside the accept
    /// loop this is only useful to tests and diagnostics.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Hex form used for persistence (`identity_hex` column) and logs.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Failure to deliver an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The identity was never registered, already disconnected, or
    /// superseded by a reconnect.
    #[error("identity {0} is stale or disconnected")]
    StaleIdentity(Identity),
    /// The connection is alive but its outbound buffer is full.
    #[error("outbound buffer full for identity {0}")]
    Backpressure(Identity),
}

/// Inbound transport events consumed by the broker loop.
#[derive(Debug)]
pub enum RouterEvent {
    /// A complete frame arrived from the given identity.
    Frame { identity: Identity, payload: Bytes },
    /// The connection behind the identity closed.
    Disconnected { identity: Identity },
}

/// Cloneable sending half of the router: lets the broker push frames to any
/// live identity without touching the accept loop.
#[derive(Clone, Default)]
pub struct RouterHandle {
    connections: Arc<Mutex<HashMap<Identity, mpsc::Sender<Bytes>>>>,
}

impl RouterHandle {
    /// Fire-and-forget send to one identity. Never awaits: a dead identity
    /// or a saturated connection fails immediately and the caller decides
    /// what the failure means.
    pub fn send(&self, identity: Identity, payload: Bytes) -> Result<(), SendError> {
        let connections = self.connections.lock().expect("router table lock poisoned");
        let Some(tx) = connections.get(&identity) else {
            return Err(SendError::StaleIdentity(identity));
        };
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::Backpressure(identity)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::StaleIdentity(identity)),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("router table lock poisoned")
            .len()
    }

    fn insert(&self, identity: Identity, tx: mpsc::Sender<Bytes>) {
        self.connections
            .lock()
            .expect("router table lock poisoned")
            .insert(identity, tx);
    }

    fn remove(&self, identity: Identity) {
        self.connections
            .lock()
            .expect("router table lock poisoned")
            .remove(&identity);
    }
}

/// The listening side of the transport.
pub struct Router {
    listener: TcpListener,
    handle: RouterHandle,
    events: mpsc::Sender<RouterEvent>,
    next_identity: AtomicU64,
}

impl Router {
    /// Bind the transport. A bind failure is the one fatal startup error:
    /// the caller is expected to abort with the diagnostic.
    pub async fn bind(addr: &str, events: mpsc::Sender<RouterEvent>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind router transport to {addr}"))?;
        info!(addr, "router transport bound");
        Ok(Self {
            listener,
            handle: RouterHandle::default(),
            events,
            next_identity: AtomicU64::new(1),
        })
    }

    /// The actual bound address (useful when binding port 0 in tests).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("failed to read router local address")
    }

    pub fn handle(&self) -> RouterHandle {
        self.handle.clone()
    }

    /// Accept loop. Runs until cancelled; each connection gets its own task.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let identity = Identity(self.next_identity.fetch_add(1, Ordering::Relaxed));
                    debug!(%identity, %peer, "connection accepted");
                    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_DEPTH);
                    self.handle.insert(identity, out_tx);
                    let handle = self.handle.clone();
                    let events = self.events.clone();
                    tokio::spawn(run_connection(identity, stream, handle, events, out_rx));
                }
                Err(err) => {
                    // Transient accept errors (EMFILE and friends) are not
                    // fatal; log and keep accepting.
                    warn!(error = %err, "failed to accept connection");
                }
            }
        }
        info!("router transport stopped");
    }
}

/// Per-connection task: pump inbound frames to the broker and outbound
/// frames to the socket until either side goes away.
async fn run_connection(
    identity: Identity,
    stream: TcpStream,
    handle: RouterHandle,
    events: mpsc::Sender<RouterEvent>,
    mut out_rx: mpsc::Receiver<Bytes>,
) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut frames) = framed.split();

    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(payload) => {
                    if let Err(err) = sink.send(payload).await {
                        debug!(%identity, error = %err, "write failed, closing connection");
                        break;
                    }
                }
                None => break,
            },
            inbound = frames.next() => match inbound {
                Some(Ok(payload)) => {
                    if events
                        .send(RouterEvent::Frame { identity, payload: payload.freeze() })
                        .await
                        .is_err()
                    {
                        // Broker gone; nothing left to do for this connection.
                        break;
                    }
                }
                Some(Err(err)) => {
                    debug!(%identity, error = %err, "read failed, closing connection");
                    break;
                }
                None => break,
            },
        }
    }

    handle.remove(identity);
    let _ = events.send(RouterEvent::Disconnected { identity }).await;
    debug!(%identity, "connection closed");
}
