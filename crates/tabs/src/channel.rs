/// One tab's view of the shared editing context.
///
/// Local mutations go through [`TabHub::commit`] (store first, then
/// broadcast). Incoming events are applied by [`CrossTabChannel::pump`] or
/// [`CrossTabChannel::run`]; a state event older than the revision the tab
/// already holds is dropped, so every tab converges on the last committed
/// write. A tab that falls behind the broadcast buffer reloads from the
/// store.
use offline::{Connectivity, PendingOperation};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};

use crate::{
    EditorSnapshot, LocalState, Result, SharedTabState, TabError, TabEvent, TabEventKind, TabHub,
    TabId,
};

type Listener = Arc<dyn Fn(&TabEvent) -> anyhow::Result<()> + Send + Sync>;

struct ChannelInner {
    id: TabId,
    hub: TabHub,
    local: Mutex<LocalState>,
    listeners: Mutex<HashMap<TabEventKind, Vec<(u64, Listener)>>>,
    next_listener: AtomicU64,
    rx: tokio::sync::Mutex<broadcast::Receiver<TabEvent>>,
    closed: watch::Sender<bool>,
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn is_registered(&self, kind: TabEventKind, id: u64) -> bool {
        self.listeners
            .lock()
            .get(&kind)
            .is_some_and(|list| list.iter().any(|(lid, _)| *lid == id))
    }

    fn remove_listener(&self, kind: TabEventKind, id: u64) {
        let mut listeners = self.listeners.lock();
        if let Some(list) = listeners.get_mut(&kind) {
            list.retain(|(lid, _)| *lid != id);
        }
    }

    /// Calls every listener of the event's kind. A failing or panicking
    /// listener is logged and skipped.
    fn deliver(&self, event: &TabEvent) -> usize {
        let listeners = self
            .listeners
            .lock()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, listener) in listeners {
            if self.is_closed() || !self.is_registered(event.kind, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => tracing::warn!(
                    tab_id = %self.id,
                    listener = id,
                    kind = %event.kind,
                    error = %format!("{e:#}"),
                    "tab listener failed"
                ),
                Err(_) => tracing::error!(
                    tab_id = %self.id,
                    listener = id,
                    kind = %event.kind,
                    "tab listener panicked"
                ),
            }
        }
        delivered
    }

    /// Applies an incoming event and delivers it if it changed anything.
    fn handle(&self, event: TabEvent) -> usize {
        if event.origin == self.id || self.is_closed() {
            return 0;
        }
        let applied = self.local.lock().apply(&event);
        match applied {
            Ok(true) => self.deliver(&event),
            Ok(false) => {
                tracing::debug!(tab_id = %self.id, kind = %event.kind, revision = ?event.revision, "stale tab event ignored");
                0
            }
            Err(e) => {
                tracing::warn!(tab_id = %self.id, kind = %event.kind, error = %e, "malformed tab event");
                0
            }
        }
    }

    /// Reloads every state kind from the store, delivering the ones that
    /// are newer than the local copy.
    fn resync(&self) -> Result<usize> {
        let mut delivered = 0;
        for kind in TabEventKind::STATE_KINDS {
            let event = match self.hub.load(kind) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(TabError::Serialization(e)) => {
                    tracing::warn!(tab_id = %self.id, %kind, error = %e, "skipping unreadable tab state");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let applied = self.local.lock().apply(&event);
            match applied {
                Ok(true) => delivered += self.deliver(&event),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(tab_id = %self.id, %kind, error = %e, "skipping unreadable tab state")
                }
            }
        }
        Ok(delivered)
    }
}

#[derive(Clone)]
pub struct CrossTabChannel {
    inner: Arc<ChannelInner>,
}

impl CrossTabChannel {
    /// Attaches a new tab to `hub`, starting from the durable state.
    pub fn open(hub: &TabHub) -> Result<Self> {
        // subscribe before loading so nothing committed in between is missed
        let rx = hub.subscribe();
        let (closed, _) = watch::channel(false);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                id: TabId::new(),
                hub: hub.clone(),
                local: Mutex::new(LocalState::default()),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                rx: tokio::sync::Mutex::new(rx),
                closed,
            }),
        };
        channel.inner.resync()?;
        tracing::debug!(tab_id = %channel.id(), "tab channel opened");
        Ok(channel)
    }

    pub fn id(&self) -> TabId {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(TabError::Closed);
        }
        Ok(())
    }

    pub fn state(&self) -> SharedTabState {
        self.inner.local.lock().shared.clone()
    }

    fn publish<T: Serialize>(&self, kind: TabEventKind, value: &T) -> Result<()> {
        self.ensure_open()?;
        let event = TabEvent::new(kind, serde_json::to_value(value)?, self.id());
        let committed = self.inner.hub.commit(event)?;
        self.inner.local.lock().apply(&committed)?;
        Ok(())
    }

    pub fn set_current_project(&self, project_id: Option<&str>) -> Result<()> {
        self.publish(TabEventKind::ProjectChanged, &project_id)
    }

    pub fn set_current_draft(&self, draft_id: Option<&str>) -> Result<()> {
        self.publish(TabEventKind::DraftChanged, &draft_id)
    }

    pub fn set_editor_state(&self, snapshot: Option<&EditorSnapshot>) -> Result<()> {
        self.publish(TabEventKind::EditorStateChanged, &snapshot)
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) -> Result<()> {
        self.publish(TabEventKind::ConnectivityChanged, &connectivity)
    }

    pub fn set_pending_sync(&self, pending: &[PendingOperation]) -> Result<()> {
        self.publish(TabEventKind::PendingSyncChanged, &pending)
    }

    /// Broadcasts a notification that carries no durable state.
    pub fn notify(&self, kind: TabEventKind, data: serde_json::Value) -> Result<()> {
        self.ensure_open()?;
        self.inner.hub.commit(TabEvent::new(kind, data, self.id()))?;
        Ok(())
    }

    /// Registers `listener` for `kind`. Delivery stops when the returned
    /// subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, kind: TabEventKind, listener: F) -> Result<Subscription>
    where
        F: Fn(&TabEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(Subscription {
            kind,
            id,
            channel: Arc::downgrade(&self.inner),
        })
    }

    pub fn listener_count(&self, kind: TabEventKind) -> usize {
        self.inner.listeners.lock().get(&kind).map_or(0, Vec::len)
    }

    /// Delivers every event already queued for this tab. Returns the number
    /// of listener calls that succeeded. Delivers nothing while a
    /// [`run`](Self::run) loop owns the receiver.
    pub fn pump(&self) -> Result<usize> {
        self.ensure_open()?;
        let Ok(mut rx) = self.inner.rx.try_lock() else {
            return Ok(0);
        };
        let mut delivered = 0;
        while !self.inner.is_closed() {
            match rx.try_recv() {
                Ok(event) => delivered += self.inner.handle(event),
                Err(TryRecvError::Lagged(missed)) => {
                    tracing::warn!(tab_id = %self.id(), missed, "tab fell behind, reloading state");
                    delivered += self.inner.resync()?;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(delivered)
    }

    /// Delivers events as they arrive until the channel is closed.
    pub async fn run(&self) -> Result<()> {
        self.ensure_open()?;
        let mut closed = self.inner.closed.subscribe();
        let mut rx = self.inner.rx.lock().await;
        loop {
            tokio::select! {
                _ = closed.changed() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(event) => {
                        self.inner.handle(event);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(tab_id = %self.id(), missed, "tab fell behind, reloading state");
                        self.inner.resync()?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Reloads state from the store, covering missed broadcasts.
    pub fn resync(&self) -> Result<usize> {
        self.ensure_open()?;
        self.inner.resync()
    }

    /// Detaches the tab: drops every listener and stops delivery. Further
    /// mutations fail with [`TabError::Closed`].
    pub fn close(&self) {
        if self.inner.closed.send_replace(true) {
            return;
        }
        self.inner.listeners.lock().clear();
        tracing::debug!(tab_id = %self.id(), "tab channel closed");
    }
}

/// Listener registration. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    kind: TabEventKind,
    id: u64,
    channel: Weak<ChannelInner>,
}

impl Subscription {
    pub fn kind(&self) -> TabEventKind {
        self.kind
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.channel.upgrade() {
            inner.remove_listener(self.kind, self.id);
        }
    }
}
