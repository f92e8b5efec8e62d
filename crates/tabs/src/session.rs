/// Ties one open draft's save scheduler, the connectivity monitor and the
/// pending queue to the tab channel.
use autosave::{
    DocumentPersistence, LimitsValidator, PersistenceSink, SaveAttemptState, SaveEvent,
    SaveScheduler, SaveStatus, SchedulerConfig,
};
use offline::{Connectivity, ConnectivityMonitor, QueueEvent};
use std::sync::Arc;
use store::{DraftPatch, EngineConfig, Version, VersionId, VersionMetadata};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{CrossTabChannel, EditorSnapshot, Result, TabError, TabEventKind};

pub struct EditorSession {
    draft_id: String,
    channel: CrossTabChannel,
    scheduler: SaveScheduler,
    persistence: DocumentPersistence,
    bridges: Vec<JoinHandle<()>>,
}

impl EditorSession {
    /// Opens `draft_id` in the tab behind `channel` and starts the save,
    /// connectivity and queue bridges.
    pub fn open(
        channel: CrossTabChannel,
        persistence: DocumentPersistence,
        monitor: ConnectivityMonitor,
        config: &EngineConfig,
        draft_id: &str,
    ) -> Result<Self> {
        let draft = persistence.drafts().get_draft(draft_id)?;
        let scheduler = SaveScheduler::new(
            draft_id,
            SchedulerConfig::from_engine(config),
            Arc::new(LimitsValidator),
            Arc::new(persistence.clone()),
        );
        scheduler.set_baseline(draft.content.clone());

        // subscribe before publishing the snapshot so no change falls between
        let save_events = scheduler.subscribe();
        let connectivity = monitor.subscribe();
        let queue_events = persistence.queue().subscribe();

        channel.set_current_project(Some(&draft.project_id))?;
        channel.set_current_draft(Some(draft_id))?;
        channel.set_connectivity(monitor.state())?;
        channel.set_pending_sync(&persistence.queue().pending()?)?;

        let bridges = vec![
            tokio::spawn(bridge_saves(channel.clone(), save_events)),
            tokio::spawn(bridge_connectivity(channel.clone(), connectivity)),
            tokio::spawn(bridge_queue(channel.clone(), persistence.clone(), queue_events)),
        ];
        tracing::info!(tab_id = %channel.id(), draft_id, "editor session opened");
        Ok(Self {
            draft_id: draft_id.to_string(),
            channel,
            scheduler,
            persistence,
            bridges,
        })
    }

    pub fn draft_id(&self) -> &str {
        &self.draft_id
    }

    pub fn channel(&self) -> &CrossTabChannel {
        &self.channel
    }

    pub fn scheduler(&self) -> &SaveScheduler {
        &self.scheduler
    }

    /// Content-changed hook: debounces a save and shares the unsaved
    /// snapshot with other tabs.
    pub fn edit(&self, content: &str, cursor_position: usize) -> Result<SaveAttemptState> {
        let snapshot = EditorSnapshot {
            cursor_position,
            scroll_position: self
                .channel
                .state()
                .editor_state
                .map_or(0.0, |s| s.scroll_position),
            unsaved_content: Some(content.to_string()),
            last_saved: None,
        };
        self.channel.set_editor_state(Some(&snapshot))?;
        Ok(self.scheduler.schedule_debounced_save(content))
    }

    pub async fn save(&self, content: &str) -> SaveAttemptState {
        self.scheduler.force_save(content).await
    }

    /// Records the stored draft, as last written by a validated save, as a
    /// named version.
    pub async fn checkpoint(&self, comment: &str) -> Result<VersionId> {
        let draft = self.persistence.drafts().get_draft(&self.draft_id)?;
        let id = self
            .persistence
            .create_version_record(&self.draft_id, &draft.content, VersionMetadata::manual(comment))
            .await?;
        tracing::info!(draft_id = %self.draft_id, version_id = %id, "checkpoint recorded");
        Ok(id)
    }

    /// Makes `version_id` current, writes its content back to the draft,
    /// queues it for the remote sink and tells the other tabs. Saves that
    /// were waiting on a timer are dropped.
    pub async fn restore_version(&self, version_id: VersionId) -> Result<Version> {
        let version = self
            .persistence
            .versions()
            .restore_version(&self.draft_id, version_id)?;
        self.scheduler.cancel_pending();
        let draft = self
            .persistence
            .drafts()
            .update_draft(&self.draft_id, DraftPatch::content(version.content.clone()))?;
        self.scheduler.set_baseline(version.content.clone());
        self.persistence.queue_draft_update(&draft).await?;
        self.channel.notify(
            TabEventKind::VersionRestored,
            serde_json::json!({
                "documentId": self.draft_id,
                "versionId": version.id,
                "wordCount": version.word_count,
            }),
        )?;
        Ok(version)
    }

    /// Stops the bridges and timers and detaches the tab.
    pub fn close(self) {
        for bridge in &self.bridges {
            bridge.abort();
        }
        self.scheduler.clear_auto_save();
        self.channel.close();
        tracing::info!(draft_id = %self.draft_id, "editor session closed");
    }
}

async fn bridge_saves(channel: CrossTabChannel, mut events: broadcast::Receiver<SaveEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "save events skipped");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.status != SaveStatus::Saved {
            continue;
        }
        let mut snapshot = channel.state().editor_state.unwrap_or_default();
        snapshot.unsaved_content = None;
        snapshot.last_saved = Some(event.at);
        let result = channel.set_editor_state(Some(&snapshot)).and_then(|_| {
            channel.notify(TabEventKind::DraftSaved, serde_json::to_value(&event)?)
        });
        if !forward(result) {
            break;
        }
    }
}

async fn bridge_connectivity(channel: CrossTabChannel, mut rx: watch::Receiver<Connectivity>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if !forward(channel.set_connectivity(state)) {
            break;
        }
    }
}

async fn bridge_queue(
    channel: CrossTabChannel,
    persistence: DocumentPersistence,
    mut events: broadcast::Receiver<QueueEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => QueueEvent::Drained { applied: 0 },
            Err(RecvError::Closed) => break,
        };
        let result = persistence
            .queue()
            .pending()
            .map_err(TabError::from)
            .and_then(|pending| channel.set_pending_sync(&pending));
        if !forward(result) {
            break;
        }
        if let QueueEvent::Drained { applied } = event {
            if applied == 0 {
                continue;
            }
            let data = serde_json::json!({ "applied": applied });
            if !forward(channel.notify(TabEventKind::QueueDrained, data)) {
                break;
            }
        }
    }
}

/// Logs a bridge failure. False once the channel is closed.
fn forward(result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(TabError::Closed) => false,
        Err(e) => {
            tracing::warn!(error = %e, "tab bridge update failed");
            true
        }
    }
}
