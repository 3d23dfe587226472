//! Persistence with live failover.
//!
//! [`FallbackStore`] fronts the durable PostgreSQL backend and the
//! in-memory backend behind one handle. A connectivity probe (plus
//! demotion on any durable-side failure) decides which backend is active;
//! the flip is a single atomic flag loaded once per operation, so no
//! operation ever straddles both backends.
//!
//! Writes never block the caller: they are queued to a writer task.
//! Client/task record writes travel an unbounded lane and are never shed;
//! output-log appends travel a bounded lane and are dropped (counted) when
//! it saturates. Event-log entries ride the record lane, matching the
//! policy that only informational output may be lost under load.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::mem::MemBackend;
use crate::models::{
    ClientRecord, LogEntry, LogType, NewLogEntry, StoreCounts, StoreStatus, Task,
    TaskStatusUpdate,
};
use crate::pg::PgBackend;

/// Default capacity of the sheddable log lane.
pub const DEFAULT_LOG_QUEUE_DEPTH: usize = 1024;

/// Default interval between connectivity probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

enum WriteOp {
    UpsertClient(ClientRecord),
    InsertTask(Task),
    UpdateTaskStatus(TaskStatusUpdate),
    AppendLog(NewLogEntry),
    /// Test/shutdown synchronization point: acked once every earlier write
    /// on the same lane has been applied.
    Barrier(oneshot::Sender<()>),
}

struct Shared {
    durable: Option<PgBackend>,
    ephemeral: MemBackend,
    /// True while the durable backend is taking reads and writes.
    durable_active: AtomicBool,
    shed_log_writes: AtomicU64,
}

impl Shared {
    fn active_backend(&self) -> &dyn Backend {
        if self.durable_active.load(Ordering::Acquire) {
            match &self.durable {
                Some(pg) => pg,
                None => &self.ephemeral,
            }
        } else {
            &self.ephemeral
        }
    }

    fn demote(&self, reason: &str) {
        if self.durable_active.swap(false, Ordering::AcqRel) {
            warn!(reason, "durable backend unreachable, failing over to memory");
        }
    }

    fn promote(&self) {
        if !self.durable_active.swap(true, Ordering::AcqRel) {
            info!("durable backend recovered, resuming durable writes");
        }
    }
}

/// Handle to the persistence layer. Cheap to clone; all clones share the
/// same backends, writer task, and active-backend flag.
#[derive(Clone)]
pub struct FallbackStore {
    shared: Arc<Shared>,
    record_tx: mpsc::UnboundedSender<WriteOp>,
    log_tx: mpsc::Sender<WriteOp>,
}

impl FallbackStore {
    /// Spawn the store with an optional durable backend.
    ///
    /// When `durable` is `None` (or the probe later demotes it), everything
    /// lands in memory and [`StoreStatus::degraded`] is reported. The writer
    /// and probe tasks live until every handle is dropped.
    pub fn spawn(durable: Option<PgBackend>) -> Self {
        Self::spawn_with(durable, DEFAULT_LOG_QUEUE_DEPTH, DEFAULT_PROBE_INTERVAL)
    }

    /// [`Self::spawn`] with explicit queue depth and probe interval.
    pub fn spawn_with(
        durable: Option<PgBackend>,
        log_queue_depth: usize,
        probe_interval: Duration,
    ) -> Self {
        let has_durable = durable.is_some();
        let shared = Arc::new(Shared {
            durable,
            ephemeral: MemBackend::new(),
            durable_active: AtomicBool::new(has_durable),
            shed_log_writes: AtomicU64::new(0),
        });

        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let (log_tx, log_rx) = mpsc::channel(log_queue_depth);

        tokio::spawn(writer_loop(Arc::clone(&shared), record_rx, log_rx));
        if has_durable {
            tokio::spawn(probe_loop(Arc::downgrade(&shared), probe_interval));
        }

        Self {
            shared,
            record_tx,
            log_tx,
        }
    }

    /// Memory-only store for tests and durable-less deployments.
    pub fn in_memory() -> Self {
        Self::spawn(None)
    }

    // -- write path (non-blocking) ------------------------------------------

    pub fn upsert_client(&self, record: ClientRecord) {
        let _ = self.record_tx.send(WriteOp::UpsertClient(record));
    }

    pub fn insert_task(&self, task: Task) {
        let _ = self.record_tx.send(WriteOp::InsertTask(task));
    }

    pub fn update_task_status(&self, update: TaskStatusUpdate) {
        let _ = self.record_tx.send(WriteOp::UpdateTaskStatus(update));
    }

    /// Queue a log append. Output entries go through the bounded lane and
    /// are shed under backpressure; event entries are never shed.
    pub fn append_log(&self, entry: NewLogEntry) {
        match entry.log_type {
            LogType::Event => {
                let _ = self.record_tx.send(WriteOp::AppendLog(entry));
            }
            LogType::Output => {
                if let Err(mpsc::error::TrySendError::Full(_)) =
                    self.log_tx.try_send(WriteOp::AppendLog(entry))
                {
                    let shed = self.shared.shed_log_writes.fetch_add(1, Ordering::Relaxed) + 1;
                    debug!(total_shed = shed, "log queue full, shedding output write");
                }
            }
        }
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.record_tx.send(WriteOp::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
        let (tx, rx) = oneshot::channel();
        if self.log_tx.send(WriteOp::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    // -- read path ----------------------------------------------------------

    pub async fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        self.read(|b| b.list_clients()).await
    }

    pub async fn list_tasks(&self, limit: i64) -> Result<Vec<Task>> {
        self.read(move |b| b.list_tasks(limit)).await
    }

    pub async fn get_client_logs(&self, client_id: &str, limit: i64) -> Result<Vec<LogEntry>> {
        self.read(move |b| b.get_client_logs(client_id, limit)).await
    }

    pub async fn get_status(&self) -> StoreStatus {
        let degraded = !self.shared.durable_active.load(Ordering::Acquire);
        let backend = if degraded { "memory" } else { "postgres" };
        let counts = self
            .read(|b| b.counts())
            .await
            .unwrap_or(StoreCounts::default());
        StoreStatus {
            backend,
            degraded,
            clients: counts.clients,
            tasks: counts.tasks,
            shed_log_writes: self.shared.shed_log_writes.load(Ordering::Relaxed),
        }
    }

    /// Whether the durable backend is currently active.
    pub fn is_durable_active(&self) -> bool {
        self.shared.durable_active.load(Ordering::Acquire)
    }

    /// Run a read against the active backend, demoting and retrying against
    /// memory if the durable side fails mid-read.
    async fn read<'a, T, F, Fut>(&'a self, op: F) -> Result<T>
    where
        F: Fn(&'a dyn Backend) -> Fut,
        Fut: Future<Output = Result<T>> + 'a,
    {
        let durable_first = self.shared.durable_active.load(Ordering::Acquire);
        if durable_first {
            if let Some(pg) = &self.shared.durable {
                match op(pg).await {
                    Ok(value) => return Ok(value),
                    Err(err) => self.shared.demote(&format!("read failed: {err:#}")),
                }
            }
        }
        op(&self.shared.ephemeral).await
    }
}

/// Apply one write to the active backend. A durable-side failure demotes
/// and re-applies to memory so record writes are never lost.
async fn apply(shared: &Shared, op: &WriteOp) {
    let durable = shared.durable_active.load(Ordering::Acquire);
    if durable {
        if let Some(pg) = &shared.durable {
            match apply_to(pg, op).await {
                Ok(()) => return,
                Err(err) => shared.demote(&format!("write failed: {err:#}")),
            }
        }
    }
    if let Err(err) = apply_to(&shared.ephemeral, op).await {
        warn!(error = %err, "memory backend write failed");
    }
}

async fn apply_to(backend: &dyn Backend, op: &WriteOp) -> Result<()> {
    match op {
        WriteOp::UpsertClient(record) => backend.upsert_client(record).await,
        WriteOp::InsertTask(task) => backend.insert_task(task).await,
        WriteOp::UpdateTaskStatus(update) => backend.update_task_status(update).await,
        WriteOp::AppendLog(entry) => {
            let inserted = backend.append_log(entry).await?;
            if !inserted {
                debug!(
                    client_id = %entry.client_id,
                    msg_id = %entry.msg_id,
                    "duplicate log delivery deduplicated"
                );
            }
            Ok(())
        }
        WriteOp::Barrier(_) => Ok(()),
    }
}

/// Writer task: drains both lanes, record lane first.
async fn writer_loop(
    shared: Arc<Shared>,
    mut record_rx: mpsc::UnboundedReceiver<WriteOp>,
    mut log_rx: mpsc::Receiver<WriteOp>,
) {
    let mut record_open = true;
    let mut log_open = true;

    while record_open || log_open {
        let op = tokio::select! {
            biased;
            op = record_rx.recv(), if record_open => match op {
                Some(op) => op,
                None => {
                    record_open = false;
                    continue;
                }
            },
            op = log_rx.recv(), if log_open => match op {
                Some(op) => op,
                None => {
                    log_open = false;
                    continue;
                }
            },
        };

        if let WriteOp::Barrier(ack) = op {
            let _ = ack.send(());
            continue;
        }
        apply(&shared, &op).await;
    }
}

/// Probe task: periodically pings the durable backend and flips the active
/// flag on failure or recovery. Exits when the store is dropped.
async fn probe_loop(shared: std::sync::Weak<Shared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let Some(pg) = &shared.durable else {
            return;
        };
        match pg.ping().await {
            Ok(()) => shared.promote(),
            Err(err) => shared.demote(&format!("probe failed: {err:#}")),
        }
    }
}
