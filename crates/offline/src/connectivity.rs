/// Process-wide connectivity state.
/// Persisted so that a freshly opened tab starts from the last known state.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use store::SharedDb;
use tokio::sync::watch;

use crate::Result;

pub const CONNECTIVITY_KEY: &str = "offline.connectivity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    #[default]
    Online,
    Offline,
    Syncing,
}

impl Connectivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Syncing => "syncing",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            "syncing" => Some(Self::Syncing),
            _ => None,
        }
    }
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    db: SharedDb,
    tx: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    /// Restores the persisted state, defaulting to online. A stored
    /// `syncing` belongs to a drain that died with its process and is
    /// restored as online.
    pub fn open(db: SharedDb) -> Result<Self> {
        let stored = db.lock().kv_get(CONNECTIVITY_KEY)?;
        let mut initial = stored
            .and_then(|entry| Connectivity::parse(&entry.value))
            .unwrap_or_default();
        if initial == Connectivity::Syncing {
            tracing::warn!("abandoned sync found, resuming as online");
            initial = Connectivity::Online;
            db.lock().kv_set(CONNECTIVITY_KEY, initial.as_str())?;
        }
        tracing::debug!(state = %initial, "connectivity restored");
        let (tx, _rx) = watch::channel(initial);
        Ok(Self {
            db,
            tx: Arc::new(tx),
        })
    }

    pub fn state(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == Connectivity::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }

    /// Persists and publishes `state`. Returns false when nothing changed.
    pub fn set(&self, state: Connectivity) -> Result<bool> {
        let previous = self.state();
        if previous == state {
            return Ok(false);
        }
        self.db.lock().kv_set(CONNECTIVITY_KEY, state.as_str())?;
        self.tx.send_replace(state);
        tracing::info!(from = %previous, to = %state, "connectivity changed");
        Ok(true)
    }

    /// Network-available signal. A syncing monitor stays syncing.
    pub fn go_online(&self) -> Result<bool> {
        match self.state() {
            Connectivity::Offline => self.set(Connectivity::Online),
            Connectivity::Online | Connectivity::Syncing => Ok(false),
        }
    }

    /// Network-loss signal, valid from any state.
    pub fn go_offline(&self) -> Result<bool> {
        self.set(Connectivity::Offline)
    }

    pub fn begin_sync(&self) -> Result<bool> {
        match self.state() {
            Connectivity::Online => self.set(Connectivity::Syncing),
            _ => Ok(false),
        }
    }

    pub fn finish_sync(&self) -> Result<bool> {
        match self.state() {
            Connectivity::Syncing => self.set(Connectivity::Online),
            _ => Ok(false),
        }
    }
}
