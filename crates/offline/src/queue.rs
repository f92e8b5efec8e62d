/// Durable FIFO of mutations awaiting the remote sink.
/// Operations are replayed one at a time, in enqueue order. A rejected
/// operation halts the drain and stays at the head of the queue.
use std::sync::Arc;
use store::SharedDb;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::{
    Connectivity, ConnectivityMonitor, EntityType, OfflineError, OpAction, OperationId,
    PendingOperation, Result,
};

/// Remote target that pending operations are replayed against
#[async_trait::async_trait]
pub trait RemoteSink: Send + Sync {
    async fn apply(&self, operation: &PendingOperation) -> anyhow::Result<()>;
}

/// Stand-in for the remote backend; accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullRemoteSink;

#[async_trait::async_trait]
impl RemoteSink for NullRemoteSink {
    async fn apply(&self, operation: &PendingOperation) -> anyhow::Result<()> {
        tracing::debug!(op_id = %operation.id, action = operation.action.as_str(), "remote sink stub accepted operation");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued(PendingOperation),
    Applied(OperationId),
    Drained { applied: usize },
    Halted { op_id: OperationId, reason: String },
}

/// Leaves the syncing state when a drain exits early, including when the
/// drain future is dropped mid-replay.
struct SyncGuard<'a> {
    connectivity: &'a ConnectivityMonitor,
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        match self.connectivity.finish_sync() {
            Ok(true) => tracing::warn!("drain ended early, connectivity back to online"),
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "could not leave syncing state"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub applied: usize,
    pub remaining: usize,
}

struct QueueInner {
    db: SharedDb,
    connectivity: ConnectivityMonitor,
    sink: Arc<dyn RemoteSink>,
    drain_lock: Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

#[derive(Clone)]
pub struct PendingOpQueue {
    inner: Arc<QueueInner>,
}

impl PendingOpQueue {
    pub fn new(db: SharedDb, connectivity: ConnectivityMonitor, sink: Arc<dyn RemoteSink>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(QueueInner {
                db,
                connectivity,
                sink,
                drain_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Appends an operation to the durable queue and, when online, tries to
    /// drain right away. A failed drain leaves the operation queued.
    pub async fn enqueue(
        &self,
        action: OpAction,
        entity_type: EntityType,
        payload: serde_json::Value,
    ) -> Result<PendingOperation> {
        let operation = PendingOperation::new(action, entity_type, payload);
        self.inner.db.lock().insert_pending_op(&operation.to_row()?)?;
        tracing::debug!(
            op_id = %operation.id,
            action = action.as_str(),
            entity = entity_type.as_str(),
            "operation enqueued"
        );
        let _ = self.inner.events.send(QueueEvent::Enqueued(operation.clone()));

        if self.inner.connectivity.is_online() {
            if let Err(e) = self.drain().await {
                tracing::warn!(error = %e, "drain after enqueue halted");
            }
        }
        Ok(operation)
    }

    /// Replays queued operations in order until the queue is empty or an
    /// operation fails. No-op unless online.
    pub async fn drain(&self) -> Result<DrainReport> {
        let _guard = self.inner.drain_lock.lock().await;
        let connectivity = &self.inner.connectivity;

        if connectivity.state() != Connectivity::Online {
            return Ok(DrainReport {
                applied: 0,
                remaining: self.len()?,
            });
        }
        if self.inner.db.lock().peek_pending_op()?.is_none() {
            return Ok(DrainReport::default());
        }

        connectivity.begin_sync()?;
        let _sync = SyncGuard { connectivity };
        let mut applied = 0;
        loop {
            // a network-loss signal during replay stops the drain
            if connectivity.state() != Connectivity::Syncing {
                tracing::info!(applied, "drain interrupted by connectivity change");
                return Ok(DrainReport {
                    applied,
                    remaining: self.len()?,
                });
            }

            let row = self.inner.db.lock().peek_pending_op()?;
            let Some(row) = row else { break };
            let operation = match PendingOperation::try_from(row) {
                Ok(op) => op,
                Err(e) => {
                    connectivity.go_offline()?;
                    return Err(e);
                }
            };

            match self.inner.sink.apply(&operation).await {
                Ok(()) => {
                    self.inner
                        .db
                        .lock()
                        .delete_pending_op(&operation.id.to_string())?;
                    applied += 1;
                    let _ = self.inner.events.send(QueueEvent::Applied(operation.id));
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::warn!(op_id = %operation.id, applied, %reason, "drain halted");
                    connectivity.go_offline()?;
                    let _ = self.inner.events.send(QueueEvent::Halted {
                        op_id: operation.id,
                        reason: reason.clone(),
                    });
                    return Err(OfflineError::Replay {
                        op_id: operation.id,
                        reason,
                    });
                }
            }
        }

        connectivity.finish_sync()?;
        tracing::info!(applied, "pending queue drained");
        let _ = self.inner.events.send(QueueEvent::Drained { applied });
        Ok(DrainReport {
            applied,
            remaining: 0,
        })
    }

    pub fn pending(&self) -> Result<Vec<PendingOperation>> {
        let rows = self.inner.db.lock().list_pending_ops()?;
        rows.into_iter().map(PendingOperation::try_from).collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.inner.db.lock().count_pending_ops()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<usize> {
        Ok(self.inner.db.lock().clear_pending_ops()?)
    }

    /// Drains whenever connectivity changes to online while operations are
    /// queued. Runs until the task is aborted.
    pub async fn run_reconnect_drain(self) {
        let rx = self.inner.connectivity.subscribe();
        self.reconnect_loop(rx).await
    }

    /// Like [`run_reconnect_drain`](Self::run_reconnect_drain), but listens
    /// from the moment of the call rather than from the task's first poll.
    pub fn spawn_reconnect_drain(&self) -> JoinHandle<()> {
        let rx = self.inner.connectivity.subscribe();
        tokio::spawn(self.clone().reconnect_loop(rx))
    }

    // The watch channel keeps only the latest value, so an offline/online
    // flip between two polls shows up as online with no visible offline.
    async fn reconnect_loop(self, mut rx: watch::Receiver<Connectivity>) {
        while rx.changed().await.is_ok() {
            let current = *rx.borrow_and_update();
            if current != Connectivity::Online {
                continue;
            }
            match self.is_empty() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "could not inspect pending queue");
                    continue;
                }
            }
            match self.drain().await {
                Ok(report) => tracing::debug!(applied = report.applied, "reconnect drain finished"),
                Err(e) => tracing::warn!(error = %e, "reconnect drain halted"),
            }
            // the drain's own syncing/online changes are not reconnects
            rx.borrow_and_update();
        }
    }
}
