/// Shared tab state and the events that carry it between tabs.
use chrono::{DateTime, Utc};
use offline::{Connectivity, PendingOperation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Identifies one open editor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(pub uuid::Uuid);

impl TabId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TabEventKind {
    ProjectChanged,
    DraftChanged,
    EditorStateChanged,
    ConnectivityChanged,
    PendingSyncChanged,
    DraftSaved,
    VersionRestored,
    QueueDrained,
}

impl TabEventKind {
    /// Kinds backed by durable state, in reload order.
    pub const STATE_KINDS: [TabEventKind; 5] = [
        Self::ProjectChanged,
        Self::DraftChanged,
        Self::EditorStateChanged,
        Self::ConnectivityChanged,
        Self::PendingSyncChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectChanged => "projectChanged",
            Self::DraftChanged => "draftChanged",
            Self::EditorStateChanged => "editorStateChanged",
            Self::ConnectivityChanged => "connectivityChanged",
            Self::PendingSyncChanged => "pendingSyncChanged",
            Self::DraftSaved => "draftSaved",
            Self::VersionRestored => "versionRestored",
            Self::QueueDrained => "queueDrained",
        }
    }

    /// Durable key for state kinds; `None` for pure notifications.
    pub fn state_key(&self) -> Option<&'static str> {
        match self {
            Self::ProjectChanged => Some("tabs.currentProjectId"),
            Self::DraftChanged => Some("tabs.currentDraftId"),
            Self::EditorStateChanged => Some("tabs.editorState"),
            Self::ConnectivityChanged => Some("tabs.connectivity"),
            Self::PendingSyncChanged => Some("tabs.pendingSync"),
            Self::DraftSaved | Self::VersionRestored | Self::QueueDrained => None,
        }
    }
}

impl fmt::Display for TabEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabEvent {
    pub kind: TabEventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub origin: TabId,
    /// Store revision of a state write; `None` for notifications
    #[serde(skip)]
    pub revision: Option<i64>,
}

impl TabEvent {
    pub fn new(kind: TabEventKind, data: serde_json::Value, origin: TabId) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            origin,
            revision: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorSnapshot {
    pub cursor_position: usize,
    pub scroll_position: f64,
    pub unsaved_content: Option<String>,
    pub last_saved: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedTabState {
    pub current_project_id: Option<String>,
    pub current_draft_id: Option<String>,
    pub editor_state: Option<EditorSnapshot>,
    pub connectivity: Connectivity,
    pub pending_sync: Vec<PendingOperation>,
}

/// A tab's in-memory copy of the shared state with the store revision
/// each field was last taken from.
#[derive(Debug, Default)]
pub(crate) struct LocalState {
    pub(crate) shared: SharedTabState,
    revisions: HashMap<TabEventKind, i64>,
}

impl LocalState {
    /// Applies a state event unless a newer revision is already held.
    /// Notifications always apply. Returns false for stale events.
    pub(crate) fn apply(&mut self, event: &TabEvent) -> serde_json::Result<bool> {
        if event.kind.state_key().is_none() {
            return Ok(true);
        }
        if let (Some(rev), Some(known)) = (event.revision, self.revisions.get(&event.kind)) {
            if rev <= *known {
                return Ok(false);
            }
        }

        let data = event.data.clone();
        match event.kind {
            TabEventKind::ProjectChanged => {
                self.shared.current_project_id = serde_json::from_value(data)?
            }
            TabEventKind::DraftChanged => self.shared.current_draft_id = serde_json::from_value(data)?,
            TabEventKind::EditorStateChanged => self.shared.editor_state = serde_json::from_value(data)?,
            TabEventKind::ConnectivityChanged => self.shared.connectivity = serde_json::from_value(data)?,
            TabEventKind::PendingSyncChanged => self.shared.pending_sync = serde_json::from_value(data)?,
            TabEventKind::DraftSaved | TabEventKind::VersionRestored | TabEventKind::QueueDrained => {}
        }
        if let Some(rev) = event.revision {
            self.revisions.insert(event.kind, rev);
        }
        Ok(true)
    }
}
