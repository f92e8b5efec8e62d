//! Cross-tab state sharing.
//!
//! Every open editor instance owns a [`CrossTabChannel`] attached to one
//! [`TabHub`]. State mutations are written through to the durable key/value
//! store first and then broadcast; the store revision decides which write
//! wins when two tabs disagree.
use thiserror::Error;

mod channel;
pub use channel::*;

mod hub;
pub use hub::*;

mod session;
pub use session::*;

mod state;
pub use state::*;

#[derive(Debug, Error)]
pub enum TabError {
    #[error("tab channel is closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("offline queue error: {0}")]
    Offline(#[from] offline::OfflineError),

    #[error("save failed: {0}")]
    Save(#[from] autosave::SaveError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TabError>;
