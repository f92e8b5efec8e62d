/// In-process stand-in for the browser's broadcast channel plus durable
/// local storage. Shared by every tab of one process.
use std::sync::Arc;
use store::SharedDb;
use tokio::sync::broadcast;

use crate::{Result, TabEvent, TabEventKind};

pub const DEFAULT_HUB_CAPACITY: usize = 256;

struct HubInner {
    db: SharedDb,
    bus: broadcast::Sender<TabEvent>,
}

#[derive(Clone)]
pub struct TabHub {
    inner: Arc<HubInner>,
}

impl TabHub {
    pub fn new(db: SharedDb) -> Self {
        Self::with_capacity(db, DEFAULT_HUB_CAPACITY)
    }

    /// `capacity` bounds how many events a slow tab may fall behind before
    /// it has to reload from the store.
    pub fn with_capacity(db: SharedDb, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner { db, bus }),
        }
    }

    pub fn db(&self) -> &SharedDb {
        &self.inner.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TabEvent> {
        self.inner.bus.subscribe()
    }

    pub fn live_tabs(&self) -> usize {
        self.inner.bus.receiver_count()
    }

    /// Writes a state event through to the store, stamps it with the store
    /// revision and broadcasts it. Notifications are only broadcast.
    pub fn commit(&self, mut event: TabEvent) -> Result<TabEvent> {
        if let Some(key) = event.kind.state_key() {
            let raw = serde_json::to_string(&event)?;
            let entry = self.inner.db.lock().kv_set(key, &raw)?;
            event.revision = Some(entry.revision);
        }
        tracing::trace!(kind = %event.kind, origin = %event.origin, revision = ?event.revision, "tab event committed");
        // no live tabs is not an error
        let _ = self.inner.bus.send(event.clone());
        Ok(event)
    }

    /// Last committed event of a state kind, with its revision.
    pub fn load(&self, kind: TabEventKind) -> Result<Option<TabEvent>> {
        let Some(key) = kind.state_key() else {
            return Ok(None);
        };
        let Some(entry) = self.inner.db.lock().kv_get(key)? else {
            return Ok(None);
        };
        let mut event: TabEvent = serde_json::from_str(&entry.value)?;
        event.revision = Some(entry.revision);
        Ok(Some(event))
    }
}
