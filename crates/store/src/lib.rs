//! Local persistence for drafts, projects, version history, the offline
//! operation queue and the durable key/value state shared between tabs.
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cache;
mod config;
mod drafts;
mod error;
mod versions;

pub use cache::*;
pub use config::*;
pub use drafts::*;
pub use error::*;
pub use versions::*;

/// Database handle shared by every component of one process.
pub type SharedDb = Arc<parking_lot::Mutex<DraftDb>>;

pub fn app_data_dir() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
    base.join("draftsave")
}

pub fn default_db_path() -> PathBuf {
    app_data_dir().join("drafts.db")
}

/// Whitespace-separated word count used for drafts and versions.
pub fn word_count(content: &str) -> usize {
    content.split_whitespace().count()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct DraftDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl DraftDb {
    pub fn open_or_create(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        tracing::debug!(path = %path.display(), "opened draft database");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        apply_migrations(&conn)?;
        Ok(Self { conn, path: None })
    }

    pub fn into_shared(self) -> SharedDb {
        Arc::new(parking_lot::Mutex::new(self))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn begin_tx(&self) -> Result<Transaction<'_>> {
        Ok(self.conn.unchecked_transaction()?)
    }

    // ---- projects ----

    pub fn insert_project(&self, row: &ProjectRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO projects(id, name, description, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![row.id, row.name, row.description, row.created_at, row.updated_at],
        )?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<ProjectRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, name, description, created_at, updated_at FROM projects WHERE id = ?1 LIMIT 1",
                params![id],
                project_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, description, created_at, updated_at FROM projects ORDER BY updated_at DESC, created_at DESC",
        )?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn update_project(&self, row: &ProjectRow) -> Result<()> {
        self.conn.execute(
            "UPDATE projects SET name = ?2, description = ?3, updated_at = ?4 WHERE id = ?1",
            params![row.id, row.name, row.description, row.updated_at],
        )?;
        Ok(())
    }

    /// Deletes a project together with its drafts and their version history.
    /// Returns the ids of the drafts that were removed.
    pub fn delete_project(&self, project_id: &str) -> Result<Vec<String>> {
        let tx = self.begin_tx()?;
        let mut draft_ids = Vec::new();
        {
            let mut stmt = tx.prepare("SELECT id FROM drafts WHERE project_id = ?1")?;
            let rows = stmt.query_map(params![project_id], |row| row.get::<_, String>(0))?;
            for r in rows {
                draft_ids.push(r?);
            }
        }
        for draft_id in &draft_ids {
            delete_document_history(&tx, draft_id)?;
        }
        tx.execute("DELETE FROM drafts WHERE project_id = ?1", params![project_id])?;
        tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
        tx.commit()?;
        Ok(draft_ids)
    }

    // ---- drafts ----

    pub fn insert_draft(&self, row: &DraftRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO drafts(id, project_id, title, content, word_count, created_at, updated_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.project_id,
                row.title,
                row.content,
                row.word_count as i64,
                row.created_at,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_draft(&self, id: &str) -> Result<Option<DraftRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, title, content, word_count, created_at, updated_at FROM drafts WHERE id = ?1 LIMIT 1",
                params![id],
                draft_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_drafts(&self, project_id: &str) -> Result<Vec<DraftRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, title, content, word_count, created_at, updated_at FROM drafts WHERE project_id = ?1 ORDER BY updated_at DESC, created_at DESC",
        )?;
        let rows = stmt.query_map(params![project_id], draft_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    pub fn update_draft(&self, row: &DraftRow) -> Result<()> {
        self.conn.execute(
            "UPDATE drafts SET title = ?2, content = ?3, word_count = ?4, updated_at = ?5 WHERE id = ?1",
            params![
                row.id,
                row.title,
                row.content,
                row.word_count as i64,
                row.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn delete_draft(&self, id: &str) -> Result<()> {
        let tx = self.begin_tx()?;
        delete_document_history(&tx, id)?;
        tx.execute("DELETE FROM drafts WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    // ---- pending operations ----

    pub fn insert_pending_op(&self, row: &PendingOpRow) -> Result<()> {
        self.conn.execute(
            "INSERT INTO pending_ops(id, action, entity_type, payload_json, enqueued_at) VALUES(?1, ?2, ?3, ?4, ?5)",
            params![
                row.id,
                row.action,
                row.entity_type,
                row.payload_json,
                row.enqueued_at
            ],
        )?;
        Ok(())
    }

    /// Pending operations in enqueue order.
    pub fn list_pending_ops(&self) -> Result<Vec<PendingOpRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, action, entity_type, payload_json, enqueued_at FROM pending_ops ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingOpRow {
                id: row.get(0)?,
                action: row.get(1)?,
                entity_type: row.get(2)?,
                payload_json: row.get(3)?,
                enqueued_at: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Oldest pending operation, if any.
    pub fn peek_pending_op(&self) -> Result<Option<PendingOpRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, action, entity_type, payload_json, enqueued_at FROM pending_ops ORDER BY seq ASC LIMIT 1",
                [],
                |row| {
                    Ok(PendingOpRow {
                        id: row.get(0)?,
                        action: row.get(1)?,
                        entity_type: row.get(2)?,
                        payload_json: row.get(3)?,
                        enqueued_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete_pending_op(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM pending_ops WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn clear_pending_ops(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM pending_ops", [])?)
    }

    pub fn count_pending_ops(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_ops", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    // ---- durable key/value state ----

    pub fn kv_get(&self, key: &str) -> Result<Option<KvEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT key, value, revision, updated_at FROM kv WHERE key = ?1 LIMIT 1",
                params![key],
                kv_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Writes `value` under `key` and stamps it with the next store-wide
    /// revision. Later revisions always win.
    pub fn kv_set(&self, key: &str, value: &str) -> Result<KvEntry> {
        let tx = self.begin_tx()?;
        let revision: i64 =
            tx.query_row("SELECT COALESCE(MAX(revision), 0) + 1 FROM kv", [], |row| {
                row.get(0)
            })?;
        let now = now_millis();
        tx.execute(
            "INSERT INTO kv(key, value, revision, updated_at) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, revision = excluded.revision, updated_at = excluded.updated_at",
            params![key, value, revision, now],
        )?;
        tx.commit()?;
        Ok(KvEntry {
            key: key.to_string(),
            value: value.to_string(),
            revision,
            updated_at: now,
        })
    }

    pub fn kv_delete(&self, key: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(n > 0)
    }

    pub fn kv_list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value, revision, updated_at FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], kv_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

fn delete_document_history(tx: &Transaction<'_>, document_id: &str) -> Result<()> {
    tx.execute(
        "DELETE FROM versions WHERE document_id = ?1",
        params![document_id],
    )?;
    tx.execute(
        "DELETE FROM version_pointers WHERE document_id = ?1",
        params![document_id],
    )?;
    tx.execute(
        "DELETE FROM version_restores WHERE document_id = ?1",
        params![document_id],
    )?;
    Ok(())
}

fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn draft_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DraftRow> {
    Ok(DraftRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        word_count: row.get::<_, i64>(4)?.max(0) as usize,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn kv_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KvEntry> {
    Ok(KvEntry {
        key: row.get(0)?,
        value: row.get(1)?,
        revision: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DraftRow {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub content: String,
    pub word_count: usize,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOpRow {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub payload_json: String,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub revision: i64,
    pub updated_at: i64,
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    const MIGRATIONS: &[(&str, &str)] = &[
        ("V0001__init", include_str!("../migrations/V0001__init.sql")),
        (
            "V0002__versions",
            include_str!("../migrations/V0002__versions.sql"),
        ),
        (
            "V0003__pending_ops",
            include_str!("../migrations/V0003__pending_ops.sql"),
        ),
        ("V0004__kv", include_str!("../migrations/V0004__kv.sql")),
    ];
    for (name, sql) in MIGRATIONS {
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, strftime('%s','now'))",
            params![name],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> PendingOpRow {
        PendingOpRow {
            id: id.to_string(),
            action: "update".to_string(),
            entity_type: "draft".to_string(),
            payload_json: "{}".to_string(),
            enqueued_at: now_millis(),
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("drafts.db");
        {
            let db = DraftDb::open_or_create(&path).unwrap();
            assert_eq!(db.path(), Some(path.as_path()));
        }
        let db = DraftDb::open_or_create(&path).unwrap();
        let applied: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 4);
    }

    #[test]
    fn pending_ops_keep_insertion_order() {
        let db = DraftDb::open_in_memory().unwrap();
        for id in ["c", "a", "b"] {
            db.insert_pending_op(&pending(id)).unwrap();
        }
        let ids: Vec<String> = db
            .list_pending_ops()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        assert!(db.delete_pending_op("a").unwrap());
        assert!(!db.delete_pending_op("a").unwrap());
        assert_eq!(db.count_pending_ops().unwrap(), 2);
    }

    #[test]
    fn kv_revisions_increase_across_keys() {
        let db = DraftDb::open_in_memory().unwrap();
        let a = db.kv_set("tab.a", "1").unwrap();
        let b = db.kv_set("tab.b", "2").unwrap();
        let a2 = db.kv_set("tab.a", "3").unwrap();
        assert!(a.revision < b.revision && b.revision < a2.revision);

        let stored = db.kv_get("tab.a").unwrap().unwrap();
        assert_eq!(stored.value, "3");
        assert_eq!(stored.revision, a2.revision);

        db.kv_set("other", "x").unwrap();
        assert_eq!(db.kv_list_prefix("tab.").unwrap().len(), 2);
        assert!(db.kv_delete("other").unwrap());
        assert!(db.kv_get("other").unwrap().is_none());
    }

    #[test]
    fn word_count_ignores_extra_whitespace() {
        assert_eq!(word_count(""), 0);
        assert_eq!(word_count("  hello \n\t world  "), 2);
    }
}
