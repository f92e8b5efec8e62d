//! Append-only, retention-bounded version history per document.
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::{now_millis, EngineConfig, Result, SharedDb, StoreError};

pub const DEFAULT_VERSION_RETENTION: usize = 50;

/// Globally unique version identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionId(pub Uuid);

impl VersionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| StoreError::not_found("version", raw))
    }
}

impl Default for VersionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    #[serde(default)]
    pub is_auto_save: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_mode: Option<String>,
}

impl VersionMetadata {
    pub fn auto_save() -> Self {
        Self {
            is_auto_save: true,
            ..Self::default()
        }
    }

    pub fn manual(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub document_id: String,
    pub content: String,
    pub word_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub metadata: VersionMetadata,
}

/// Word-level change counts between two versions. Approximate: counts are
/// multiset differences, not a minimal edit script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDiff {
    pub added: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRecord {
    pub document_id: String,
    pub version_id: VersionId,
    pub restored_at: chrono::DateTime<chrono::Utc>,
}

pub fn word_diff(old: &str, new: &str) -> VersionDiff {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for word in old.split_whitespace() {
        *counts.entry(word).or_default() -= 1;
    }
    for word in new.split_whitespace() {
        *counts.entry(word).or_default() += 1;
    }
    let mut diff = VersionDiff::default();
    for delta in counts.into_values() {
        if delta > 0 {
            diff.added += delta as usize;
        } else {
            diff.removed += delta.unsigned_abs() as usize;
        }
    }
    diff
}

const VERSION_COLUMNS: &str = "id, document_id, content, word_count, metadata_json, created_at";

fn version_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Version)> {
    let raw_id: String = row.get(0)?;
    let metadata_json: String = row.get(4)?;
    let created_at: i64 = row.get(5)?;
    let id = Uuid::parse_str(&raw_id).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok((
        raw_id,
        Version {
            id: VersionId(id),
            document_id: row.get(1)?,
            content: row.get(2)?,
            word_count: row.get::<_, i64>(3)?.max(0) as usize,
            created_at: chrono::DateTime::from_timestamp_millis(created_at).unwrap_or_default(),
            metadata,
        },
    ))
}

pub struct VersionStore {
    db: SharedDb,
    retention: usize,
}

impl VersionStore {
    pub fn new(db: SharedDb, config: &EngineConfig) -> Self {
        Self::with_retention(db, config.version_retention)
    }

    pub fn with_retention(db: SharedDb, retention: usize) -> Self {
        Self {
            db,
            retention: retention.max(1),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Appends a version, makes it current and evicts the oldest versions
    /// beyond the retention bound.
    pub fn create_version(
        &self,
        document_id: &str,
        content: &str,
        word_count: usize,
        metadata: VersionMetadata,
    ) -> Result<VersionId> {
        let id = VersionId::new();
        let now = now_millis();
        let metadata_json = serde_json::to_string(&metadata)?;

        let db = self.db.lock();
        let tx = db.begin_tx()?;
        tx.execute(
            "INSERT INTO versions(id, document_id, content, word_count, metadata_json, created_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.to_string(),
                document_id,
                content,
                word_count as i64,
                metadata_json,
                now
            ],
        )?;
        tx.execute(
            "INSERT INTO version_pointers(document_id, version_id, updated_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(document_id) DO UPDATE SET version_id = excluded.version_id, updated_at = excluded.updated_at",
            params![document_id, id.to_string(), now],
        )?;

        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM versions WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        let excess = count - self.retention as i64;
        if excess > 0 {
            tx.execute(
                "DELETE FROM versions WHERE seq IN (SELECT seq FROM versions WHERE document_id = ?1 ORDER BY seq ASC LIMIT ?2)",
                params![document_id, excess],
            )?;
            tracing::debug!(document_id, evicted = excess, "version retention trimmed");
        }
        tx.commit()?;
        Ok(id)
    }

    /// Creates an auto-save version unless `content` matches the latest
    /// stored version byte for byte.
    pub fn auto_save_version(
        &self,
        document_id: &str,
        content: &str,
        word_count: usize,
    ) -> Result<Option<VersionId>> {
        let latest: Option<String> = self
            .db
            .lock()
            .connection()
            .query_row(
                "SELECT content FROM versions WHERE document_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()?;
        if latest.as_deref() == Some(content) {
            return Ok(None);
        }
        self.create_version(document_id, content, word_count, VersionMetadata::auto_save())
            .map(Some)
    }

    pub fn get_version(&self, version_id: VersionId) -> Result<Version> {
        let db = self.db.lock();
        let found = db
            .connection()
            .query_row(
                &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE id = ?1 LIMIT 1"),
                params![version_id.to_string()],
                version_from_row,
            )
            .optional()?;
        found
            .map(|(_, v)| v)
            .ok_or_else(|| StoreError::not_found("version", version_id.to_string()))
    }

    /// The version the document's current pointer refers to.
    pub fn current_version(&self, document_id: &str) -> Result<Option<Version>> {
        let db = self.db.lock();
        let found = db
            .connection()
            .query_row(
                "SELECT v.id, v.document_id, v.content, v.word_count, v.metadata_json, v.created_at \
                 FROM version_pointers p JOIN versions v ON v.id = p.version_id WHERE p.document_id = ?1",
                params![document_id],
                version_from_row,
            )
            .optional()?;
        Ok(found.map(|(_, v)| v))
    }

    /// Makes `version_id` current for `document_id`. Intervening versions are
    /// kept; the restore itself is appended to the restore log.
    pub fn restore_version(&self, document_id: &str, version_id: VersionId) -> Result<Version> {
        let version = match self.get_version(version_id) {
            Ok(v) if v.document_id == document_id => v,
            Ok(_) | Err(StoreError::NotFound { .. }) => {
                return Err(StoreError::not_found("version", version_id.to_string()))
            }
            Err(e) => return Err(e),
        };

        let now = now_millis();
        let db = self.db.lock();
        let tx = db.begin_tx()?;
        tx.execute(
            "INSERT INTO version_pointers(document_id, version_id, updated_at) VALUES(?1, ?2, ?3)
             ON CONFLICT(document_id) DO UPDATE SET version_id = excluded.version_id, updated_at = excluded.updated_at",
            params![document_id, version_id.to_string(), now],
        )?;
        tx.execute(
            "INSERT INTO version_restores(document_id, version_id, restored_at) VALUES(?1, ?2, ?3)",
            params![document_id, version_id.to_string(), now],
        )?;
        tx.commit()?;
        tracing::info!(document_id, version_id = %version_id, "version restored");
        Ok(version)
    }

    /// Newest first.
    pub fn list_versions(
        &self,
        document_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Version>> {
        let db = self.db.lock();
        let mut stmt = db.connection().prepare(&format!(
            "SELECT {VERSION_COLUMNS} FROM versions WHERE document_id = ?1 ORDER BY seq DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![document_id, limit as i64, offset as i64],
            version_from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?.1);
        }
        Ok(out)
    }

    pub fn version_count(&self, document_id: &str) -> Result<usize> {
        let n: i64 = self.db.lock().connection().query_row(
            "SELECT COUNT(*) FROM versions WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Removes a version. A current pointer to it moves to the newest
    /// remaining version, or is cleared when none remain.
    pub fn delete_version(&self, version_id: VersionId) -> Result<()> {
        let id = version_id.to_string();
        let db = self.db.lock();
        let tx = db.begin_tx()?;
        let document_id: String = tx
            .query_row(
                "SELECT document_id FROM versions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("version", id.clone()))?;
        tx.execute("DELETE FROM versions WHERE id = ?1", params![id])?;

        let pointer: Option<String> = tx
            .query_row(
                "SELECT version_id FROM version_pointers WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .optional()?;
        if pointer.as_deref() == Some(id.as_str()) {
            let newest: Option<String> = tx
                .query_row(
                    "SELECT id FROM versions WHERE document_id = ?1 ORDER BY seq DESC LIMIT 1",
                    params![document_id],
                    |row| row.get(0),
                )
                .optional()?;
            match newest {
                Some(next) => {
                    tx.execute(
                        "UPDATE version_pointers SET version_id = ?2, updated_at = ?3 WHERE document_id = ?1",
                        params![document_id, next, now_millis()],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM version_pointers WHERE document_id = ?1",
                        params![document_id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_version_diff(&self, a: VersionId, b: VersionId) -> Result<VersionDiff> {
        let old = self.get_version(a)?;
        let new = self.get_version(b)?;
        Ok(word_diff(&old.content, &new.content))
    }

    pub fn list_restores(&self, document_id: &str) -> Result<Vec<RestoreRecord>> {
        let db = self.db.lock();
        let mut stmt = db.connection().prepare(
            "SELECT document_id, version_id, restored_at FROM version_restores WHERE document_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            let document_id: String = row.get(0)?;
            let version_id: String = row.get(1)?;
            let restored_at: i64 = row.get(2)?;
            Ok((document_id, version_id, restored_at))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (document_id, version_id, restored_at) = r?;
            out.push(RestoreRecord {
                document_id,
                version_id: VersionId::parse(&version_id)?,
                restored_at: chrono::DateTime::from_timestamp_millis(restored_at)
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }
}
