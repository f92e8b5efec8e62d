//! Offline support: connectivity tracking and a durable queue of mutations
//! that are replayed, in order, against the remote sink once online.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod connectivity;
pub use connectivity::*;

mod queue;
pub use queue::*;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("remote sink rejected operation {op_id}: {reason}")]
    Replay { op_id: OperationId, reason: String },

    #[error("corrupt pending operation {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OfflineError>;

/// Unique pending operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub uuid::Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for OpAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Draft,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Project => "project",
        }
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "project" => Ok(Self::Project),
            other => Err(format!("unknown entity type '{other}'")),
        }
    }
}

/// A mutation waiting to reach the remote sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    pub id: OperationId,
    pub action: OpAction,
    pub entity_type: EntityType,
    pub payload: serde_json::Value,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

impl PendingOperation {
    pub fn new(action: OpAction, entity_type: EntityType, payload: serde_json::Value) -> Self {
        Self {
            id: OperationId::new(),
            action,
            entity_type,
            payload,
            enqueued_at: chrono::Utc::now(),
        }
    }

    pub fn to_row(&self) -> Result<store::PendingOpRow> {
        Ok(store::PendingOpRow {
            id: self.id.to_string(),
            action: self.action.as_str().to_string(),
            entity_type: self.entity_type.as_str().to_string(),
            payload_json: serde_json::to_string(&self.payload)?,
            enqueued_at: self.enqueued_at.timestamp_millis(),
        })
    }
}

impl TryFrom<store::PendingOpRow> for PendingOperation {
    type Error = OfflineError;

    fn try_from(row: store::PendingOpRow) -> Result<Self> {
        let corrupt = |reason: String| OfflineError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let id = uuid::Uuid::parse_str(&row.id).map_err(|e| corrupt(e.to_string()))?;
        let action = row.action.parse().map_err(corrupt)?;
        let entity_type = row.entity_type.parse().map_err(corrupt)?;
        let payload = serde_json::from_str(&row.payload_json).map_err(|e| corrupt(e.to_string()))?;
        let enqueued_at = chrono::DateTime::from_timestamp_millis(row.enqueued_at)
            .ok_or_else(|| corrupt(format!("bad timestamp {}", row.enqueued_at)))?;
        Ok(Self {
            id: OperationId(id),
            action,
            entity_type,
            payload,
            enqueued_at,
        })
    }
}
