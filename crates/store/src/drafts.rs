//! Read-through draft/project service.
//!
//! Every successful write either refreshes the cached value or invalidates
//! the affected keys before returning, so a caller never reads back a cached
//! value older than its own write.
use std::time::Duration;
use uuid::Uuid;

use crate::{
    now_millis, word_count, DraftCache, DraftRow, EngineConfig, ProjectRow, Result, SharedDb,
    StoreError,
};

/// Values held by the service cache.
#[derive(Debug, Clone)]
pub enum CachedEntity {
    Draft(DraftRow),
    Drafts(Vec<DraftRow>),
    Project(ProjectRow),
    Projects(Vec<ProjectRow>),
}

#[derive(Debug, Clone, Default)]
pub struct DraftPatch {
    pub title: Option<String>,
    pub content: Option<String>,
}

impl DraftPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            title: None,
            content: Some(content.into()),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            content: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
}

fn draft_key(id: &str) -> String {
    format!("draft:{id}")
}

fn drafts_key(project_id: &str) -> String {
    format!("drafts:{project_id}")
}

fn project_key(id: &str) -> String {
    format!("project:{id}")
}

const PROJECTS_KEY: &str = "projects";

pub struct DraftService {
    db: SharedDb,
    cache: DraftCache<CachedEntity>,
}

impl DraftService {
    pub fn new(db: SharedDb, config: &EngineConfig) -> Self {
        Self::with_ttl(db, config.cache_ttl())
    }

    pub fn with_ttl(db: SharedDb, ttl: Duration) -> Self {
        Self {
            db,
            cache: DraftCache::new(ttl),
        }
    }

    pub fn db(&self) -> &SharedDb {
        &self.db
    }

    pub fn cache(&self) -> &DraftCache<CachedEntity> {
        &self.cache
    }

    // ---- projects ----

    pub fn create_project(&self, name: &str, description: Option<&str>) -> Result<ProjectRow> {
        let now = now_millis();
        let row = ProjectRow {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        self.db.lock().insert_project(&row)?;
        self.cache.set(project_key(&row.id), CachedEntity::Project(row.clone()));
        self.cache.invalidate(PROJECTS_KEY);
        tracing::debug!(project_id = %row.id, "project created");
        Ok(row)
    }

    pub fn get_project(&self, id: &str) -> Result<ProjectRow> {
        let key = project_key(id);
        if let Some(CachedEntity::Project(row)) = self.cache.get(&key) {
            return Ok(row);
        }
        let row = self
            .db
            .lock()
            .get_project(id)?
            .ok_or_else(|| StoreError::not_found("project", id))?;
        self.cache.set(key, CachedEntity::Project(row.clone()));
        Ok(row)
    }

    pub fn list_projects(&self) -> Result<Vec<ProjectRow>> {
        if let Some(CachedEntity::Projects(rows)) = self.cache.get(PROJECTS_KEY) {
            return Ok(rows);
        }
        let rows = self.db.lock().list_projects()?;
        self.cache.set(PROJECTS_KEY, CachedEntity::Projects(rows.clone()));
        Ok(rows)
    }

    pub fn update_project(&self, id: &str, patch: ProjectPatch) -> Result<ProjectRow> {
        let db = self.db.lock();
        let mut row = db
            .get_project(id)?
            .ok_or_else(|| StoreError::not_found("project", id))?;
        if let Some(name) = patch.name {
            row.name = name;
        }
        if let Some(description) = patch.description {
            row.description = description;
        }
        row.updated_at = now_millis();
        db.update_project(&row)?;
        drop(db);

        self.cache.set(project_key(id), CachedEntity::Project(row.clone()));
        self.cache.invalidate(PROJECTS_KEY);
        Ok(row)
    }

    pub fn delete_project(&self, id: &str) -> Result<()> {
        let removed_drafts = {
            let db = self.db.lock();
            if db.get_project(id)?.is_none() {
                return Err(StoreError::not_found("project", id));
            }
            db.delete_project(id)?
        };
        self.cache.invalidate(&project_key(id));
        self.cache.invalidate(PROJECTS_KEY);
        self.cache.invalidate(&drafts_key(id));
        for draft_id in &removed_drafts {
            self.cache.invalidate(&draft_key(draft_id));
        }
        tracing::debug!(project_id = id, drafts = removed_drafts.len(), "project deleted");
        Ok(())
    }

    // ---- drafts ----

    pub fn create_draft(&self, project_id: &str, title: &str, content: &str) -> Result<DraftRow> {
        let now = now_millis();
        let row = DraftRow {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            word_count: word_count(content),
            created_at: now,
            updated_at: now,
        };
        {
            let db = self.db.lock();
            if db.get_project(project_id)?.is_none() {
                return Err(StoreError::not_found("project", project_id));
            }
            db.insert_draft(&row)?;
        }
        self.cache.set(draft_key(&row.id), CachedEntity::Draft(row.clone()));
        self.cache.invalidate(&drafts_key(project_id));
        tracing::debug!(draft_id = %row.id, project_id, "draft created");
        Ok(row)
    }

    pub fn get_draft(&self, id: &str) -> Result<DraftRow> {
        let key = draft_key(id);
        if let Some(CachedEntity::Draft(row)) = self.cache.get(&key) {
            return Ok(row);
        }
        let row = self
            .db
            .lock()
            .get_draft(id)?
            .ok_or_else(|| StoreError::not_found("draft", id))?;
        self.cache.set(key, CachedEntity::Draft(row.clone()));
        Ok(row)
    }

    pub fn list_drafts(&self, project_id: &str) -> Result<Vec<DraftRow>> {
        let key = drafts_key(project_id);
        if let Some(CachedEntity::Drafts(rows)) = self.cache.get(&key) {
            return Ok(rows);
        }
        let rows = self.db.lock().list_drafts(project_id)?;
        self.cache.set(key, CachedEntity::Drafts(rows.clone()));
        Ok(rows)
    }

    pub fn update_draft(&self, id: &str, patch: DraftPatch) -> Result<DraftRow> {
        let db = self.db.lock();
        let mut row = db
            .get_draft(id)?
            .ok_or_else(|| StoreError::not_found("draft", id))?;
        if let Some(title) = patch.title {
            row.title = title;
        }
        if let Some(content) = patch.content {
            row.word_count = word_count(&content);
            row.content = content;
        }
        row.updated_at = now_millis();
        db.update_draft(&row)?;
        drop(db);

        self.cache.set(draft_key(id), CachedEntity::Draft(row.clone()));
        self.cache.invalidate(&drafts_key(&row.project_id));
        Ok(row)
    }

    pub fn delete_draft(&self, id: &str) -> Result<()> {
        let project_id = {
            let db = self.db.lock();
            let row = db
                .get_draft(id)?
                .ok_or_else(|| StoreError::not_found("draft", id))?;
            db.delete_draft(id)?;
            row.project_id
        };
        self.cache.invalidate(&draft_key(id));
        self.cache.invalidate(&drafts_key(&project_id));
        tracing::debug!(draft_id = id, "draft deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DraftDb;

    fn service() -> DraftService {
        let db = DraftDb::open_in_memory().unwrap().into_shared();
        DraftService::new(db, &EngineConfig::default())
    }

    #[test]
    fn update_then_get_returns_new_content() {
        let svc = service();
        let project = svc.create_project("Novel", None).unwrap();
        let draft = svc.create_draft(&project.id, "Chapter 1", "Hello").unwrap();

        // warm the cache with the old content
        assert_eq!(svc.get_draft(&draft.id).unwrap().content, "Hello");

        svc.update_draft(&draft.id, DraftPatch::content("Hello world"))
            .unwrap();
        let fetched = svc.get_draft(&draft.id).unwrap();
        assert_eq!(fetched.content, "Hello world");
        assert_eq!(fetched.word_count, 2);
    }

    #[test]
    fn list_is_invalidated_by_draft_writes() {
        let svc = service();
        let project = svc.create_project("Novel", None).unwrap();
        let a = svc.create_draft(&project.id, "A", "").unwrap();
        assert_eq!(svc.list_drafts(&project.id).unwrap().len(), 1);

        let b = svc.create_draft(&project.id, "B", "").unwrap();
        assert_eq!(svc.list_drafts(&project.id).unwrap().len(), 2);

        svc.update_draft(&b.id, DraftPatch::title("B2")).unwrap();
        let titles: Vec<String> = svc
            .list_drafts(&project.id)
            .unwrap()
            .into_iter()
            .map(|d| d.title)
            .collect();
        assert!(titles.contains(&"B2".to_string()));

        svc.delete_draft(&a.id).unwrap();
        assert_eq!(svc.list_drafts(&project.id).unwrap().len(), 1);
        assert!(svc.get_draft(&a.id).unwrap_err().is_not_found());
    }

    #[test]
    fn missing_entities_are_not_found() {
        let svc = service();
        assert!(svc.get_draft("nope").unwrap_err().is_not_found());
        assert!(svc.get_project("nope").unwrap_err().is_not_found());
        assert!(svc
            .update_draft("nope", DraftPatch::content("x"))
            .unwrap_err()
            .is_not_found());
        assert!(svc.create_draft("nope", "t", "").unwrap_err().is_not_found());
    }

    #[test]
    fn delete_project_drops_cached_drafts() {
        let svc = service();
        let project = svc.create_project("Novel", Some("first")).unwrap();
        let draft = svc.create_draft(&project.id, "A", "text").unwrap();
        svc.get_draft(&draft.id).unwrap();
        assert_eq!(svc.list_projects().unwrap().len(), 1);

        svc.delete_project(&project.id).unwrap();
        assert!(svc.get_draft(&draft.id).unwrap_err().is_not_found());
        assert!(svc.get_project(&project.id).unwrap_err().is_not_found());
        assert!(svc.list_projects().unwrap().is_empty());
    }

    #[test]
    fn update_project_refreshes_cache() {
        let svc = service();
        let project = svc.create_project("Novel", None).unwrap();
        svc.get_project(&project.id).unwrap();
        svc.update_project(
            &project.id,
            ProjectPatch {
                name: Some("Saga".into()),
                description: Some(Some("long".into())),
            },
        )
        .unwrap();
        let fetched = svc.get_project(&project.id).unwrap();
        assert_eq!(fetched.name, "Saga");
        assert_eq!(fetched.description.as_deref(), Some("long"));
        assert_eq!(svc.list_projects().unwrap()[0].name, "Saga");
    }
}
