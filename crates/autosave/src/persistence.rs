/// Where validated content ends up.
use offline::{EntityType, OpAction, PendingOpQueue, PendingOperation};
use std::sync::Arc;
use store::{
    DraftPatch, DraftRow, DraftService, StoreError, VersionId, VersionMetadata, VersionStore,
};

use crate::{Result, SaveError};

/// Durable target of a save. Re-saving identical content must be harmless.
#[async_trait::async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn save(&self, document_id: &str, content: &str) -> Result<()>;

    /// Records an explicit version of `content`, whether or not it differs
    /// from the latest one.
    async fn create_version_record(
        &self,
        document_id: &str,
        content: &str,
        metadata: VersionMetadata,
    ) -> Result<VersionId>;
}

impl From<StoreError> for SaveError {
    fn from(err: StoreError) -> Self {
        if err.is_not_found() {
            SaveError::Persistent {
                attempts: 1,
                last: err.to_string(),
            }
        } else {
            SaveError::Transient(err.to_string())
        }
    }
}

/// Writes drafts locally, snapshots them into the version history and
/// queues the change for the remote sink.
#[derive(Clone)]
pub struct DocumentPersistence {
    drafts: Arc<DraftService>,
    versions: Arc<VersionStore>,
    queue: PendingOpQueue,
}

impl DocumentPersistence {
    pub fn new(drafts: Arc<DraftService>, versions: Arc<VersionStore>, queue: PendingOpQueue) -> Self {
        Self {
            drafts,
            versions,
            queue,
        }
    }

    pub fn drafts(&self) -> &Arc<DraftService> {
        &self.drafts
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn queue(&self) -> &PendingOpQueue {
        &self.queue
    }

    /// Queues the current state of `draft` for the remote sink.
    pub async fn queue_draft_update(&self, draft: &DraftRow) -> offline::Result<PendingOperation> {
        let payload = serde_json::json!({
            "id": draft.id,
            "content": draft.content,
            "wordCount": draft.word_count,
        });
        self.queue
            .enqueue(OpAction::Update, EntityType::Draft, payload)
            .await
    }
}

#[async_trait::async_trait]
impl PersistenceSink for DocumentPersistence {
    async fn save(&self, document_id: &str, content: &str) -> Result<()> {
        let draft = self
            .drafts
            .update_draft(document_id, DraftPatch::content(content))?;
        let version = self
            .versions
            .auto_save_version(document_id, &draft.content, draft.word_count)?;
        tracing::debug!(
            document_id,
            word_count = draft.word_count,
            new_version = version.is_some(),
            "draft persisted"
        );

        self.queue_draft_update(&draft)
            .await
            .map_err(|e| SaveError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn create_version_record(
        &self,
        document_id: &str,
        content: &str,
        metadata: VersionMetadata,
    ) -> Result<VersionId> {
        // versions only exist for known drafts
        self.drafts.get_draft(document_id)?;
        let id = self.versions.create_version(
            document_id,
            content,
            store::word_count(content),
            metadata,
        )?;
        Ok(id)
    }
}
