//! Persistence collaborator.
//!
//! The hosted database is out of reach of this workspace, so the seam is
//! the [`RecordStore`] trait. The collaboration and generation layers only
//! ever call `create_*` and `update_*` (audit logging); the shell also reads
//! projects back. [`MemoryStore`] is the in-process implementation, with an
//! optional JSON snapshot on disk.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::records::{
    GenerationPatch, GenerationRecord, NewGeneration, NewProject, ProjectPatch, ProjectRecord,
    SessionPatch, SessionRecord,
};

/// Persistence failures. Propagated to the caller and surfaced as a failed
/// action.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("{table} record {id} not found")]
    NotFound { table: &'static str, id: Uuid },
    #[error("invalid {table} record: {reason}")]
    Invalid { table: &'static str, reason: String },
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Unavailable(e.to_string())
    }
}

/// CRUD store for project, generation-audit and session records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_project(&self, new: NewProject) -> Result<ProjectRecord, PersistenceError>;
    async fn get_project(&self, id: Uuid) -> Result<ProjectRecord, PersistenceError>;
    async fn list_projects(&self, owner_id: Uuid) -> Result<Vec<ProjectRecord>, PersistenceError>;
    async fn update_project(
        &self,
        id: Uuid,
        patch: ProjectPatch,
    ) -> Result<ProjectRecord, PersistenceError>;

    async fn create_generation(
        &self,
        new: NewGeneration,
    ) -> Result<GenerationRecord, PersistenceError>;
    async fn update_generation(
        &self,
        id: Uuid,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, PersistenceError>;

    async fn create_session(
        &self,
        project_id: Option<Uuid>,
    ) -> Result<SessionRecord, PersistenceError>;
    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> Result<SessionRecord, PersistenceError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    projects: HashMap<Uuid, ProjectRecord>,
    generations: HashMap<Uuid, GenerationRecord>,
    sessions: HashMap<Uuid, SessionRecord>,
}

/// In-memory record store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write every table to `path` as JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), PersistenceError> {
        let bytes = {
            let tables = self.tables.read().await;
            serde_json::to_vec_pretty(&*tables)?
        };
        tokio::fs::write(path, bytes).await?;
        log::debug!("Record snapshot written to {}", path.display());
        Ok(())
    }

    /// Load a store previously written by [`MemoryStore::save_snapshot`].
    pub async fn load_snapshot(path: &Path) -> Result<Self, PersistenceError> {
        let bytes = tokio::fs::read(path).await?;
        let tables: Tables = serde_json::from_slice(&bytes)?;
        log::info!(
            "Record snapshot loaded: {} projects, {} generations, {} sessions",
            tables.projects.len(),
            tables.generations.len(),
            tables.sessions.len()
        );
        Ok(Self {
            tables: RwLock::new(tables),
        })
    }

    /// Number of generation audit records (for tests and diagnostics).
    pub async fn generation_count(&self) -> usize {
        self.tables.read().await.generations.len()
    }

    pub async fn get_generation(&self, id: Uuid) -> Option<GenerationRecord> {
        self.tables.read().await.generations.get(&id).cloned()
    }

    /// Every generation audit record, oldest first.
    pub async fn generations(&self) -> Vec<GenerationRecord> {
        let mut records: Vec<_> = self.tables.read().await.generations.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub async fn get_session(&self, id: Uuid) -> Option<SessionRecord> {
        self.tables.read().await.sessions.get(&id).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_project(&self, new: NewProject) -> Result<ProjectRecord, PersistenceError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(PersistenceError::Invalid {
                table: "projects",
                reason: "name must not be empty".to_string(),
            });
        }
        let now = Utc::now();
        let record = ProjectRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: new.description.filter(|d| !d.trim().is_empty()),
            owner_id: new.owner_id,
            settings: serde_json::Value::Object(Default::default()),
            is_public: false,
            deployment_data: Default::default(),
            created_at: now,
            updated_at: now,
        };
        self.tables
            .write()
            .await
            .projects
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_project(&self, id: Uuid) -> Result<ProjectRecord, PersistenceError> {
        self.tables
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::NotFound { table: "projects", id })
    }

    async fn list_projects(&self, owner_id: Uuid) -> Result<Vec<ProjectRecord>, PersistenceError> {
        let tables = self.tables.read().await;
        let mut projects: Vec<ProjectRecord> = tables
            .projects
            .values()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn update_project(
        &self,
        id: Uuid,
        patch: ProjectPatch,
    ) -> Result<ProjectRecord, PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .projects
            .get_mut(&id)
            .ok_or(PersistenceError::NotFound { table: "projects", id })?;
        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(description) = patch.description {
            record.description = description;
        }
        if let Some(settings) = patch.settings {
            record.settings = settings;
        }
        if let Some(is_public) = patch.is_public {
            record.is_public = is_public;
        }
        if let Some(deployment_data) = patch.deployment_data {
            record.deployment_data = deployment_data;
        }
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn create_generation(
        &self,
        new: NewGeneration,
    ) -> Result<GenerationRecord, PersistenceError> {
        let record = GenerationRecord {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            user_id: new.user_id,
            prompt: new.prompt,
            model: new.model,
            context: new.context,
            response: None,
            performance: None,
            attribution: Vec::new(),
            created_at: Utc::now(),
        };
        self.tables
            .write()
            .await
            .generations
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_generation(
        &self,
        id: Uuid,
        patch: GenerationPatch,
    ) -> Result<GenerationRecord, PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .generations
            .get_mut(&id)
            .ok_or(PersistenceError::NotFound { table: "code_generations", id })?;
        if let Some(response) = patch.response {
            record.response = Some(response);
        }
        if let Some(performance) = patch.performance {
            record.performance = Some(performance);
        }
        if let Some(attribution) = patch.attribution {
            record.attribution = attribution;
        }
        Ok(record.clone())
    }

    async fn create_session(
        &self,
        project_id: Option<Uuid>,
    ) -> Result<SessionRecord, PersistenceError> {
        let record = SessionRecord {
            id: Uuid::new_v4(),
            project_id,
            participants: Vec::new(),
            active_file: None,
            chat: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        };
        self.tables
            .write()
            .await
            .sessions
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_session(
        &self,
        id: Uuid,
        patch: SessionPatch,
    ) -> Result<SessionRecord, PersistenceError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .sessions
            .get_mut(&id)
            .ok_or(PersistenceError::NotFound { table: "collaboration_sessions", id })?;
        if let Some(participants) = patch.participants {
            record.participants = participants;
        }
        if let Some(active_file) = patch.active_file {
            record.active_file = active_file;
        }
        if let Some(chat) = patch.chat {
            record.chat = chat;
        }
        if let Some(ended_at) = patch.ended_at {
            record.ended_at = Some(ended_at);
        }
        Ok(record.clone())
    }
}
