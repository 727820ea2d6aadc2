//! Project manager panel: create, list and (stub) deploy projects.

use std::sync::Arc;

use chrono::Utc;
use forge_core::{
    DeploymentConfig, NewProject, PersistenceError, ProjectPatch, ProjectRecord, RecordStore,
};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentState {
    Success,
}

impl DeploymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Success => "success",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub deployment_id: String,
    pub url: String,
    pub status: DeploymentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub id: String,
    pub status: DeploymentState,
    pub url: String,
    pub logs: Vec<String>,
}

pub struct ProjectManager {
    store: Arc<dyn RecordStore>,
    owner_id: Uuid,
}

impl ProjectManager {
    pub fn new(store: Arc<dyn RecordStore>, owner_id: Uuid) -> Self {
        Self { store, owner_id }
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> Result<ProjectRecord, PersistenceError> {
        let project = self
            .store
            .create_project(NewProject {
                name: name.to_string(),
                description: description.map(str::to_string),
                owner_id: self.owner_id,
            })
            .await?;
        log::info!("Created project {} ({})", project.name, project.id);
        Ok(project)
    }

    pub async fn get(&self, id: Uuid) -> Result<ProjectRecord, PersistenceError> {
        self.store.get_project(id).await
    }

    /// The owner's projects, oldest first.
    pub async fn list(&self) -> Result<Vec<ProjectRecord>, PersistenceError> {
        self.store.list_projects(self.owner_id).await
    }

    /// Record the deployment config and report a successful deployment.
    /// No provider is contacted.
    pub async fn deploy(
        &self,
        id: Uuid,
        config: Option<DeploymentConfig>,
    ) -> Result<Deployment, PersistenceError> {
        let project = self.store.get_project(id).await?;
        let now = Utc::now();
        let url = format!("https://{}.example.com", slug(&project.name));

        let mut data = project.deployment_data.clone();
        data.config = Some(config.unwrap_or_default());
        data.last_deployment = Some(now);
        data.url = Some(url.clone());
        self.store
            .update_project(
                id,
                ProjectPatch {
                    deployment_data: Some(data),
                    ..Default::default()
                },
            )
            .await?;

        let deployment = Deployment {
            deployment_id: format!("deploy_{}", now.timestamp_millis()),
            url,
            status: DeploymentState::Success,
        };
        log::info!("Deployed {} as {}", project.name, deployment.deployment_id);
        Ok(deployment)
    }

    pub async fn deployment_status(&self, deployment_id: &str) -> DeploymentStatus {
        DeploymentStatus {
            id: deployment_id.to_string(),
            status: DeploymentState::Success,
            url: format!("https://example.com/{deployment_id}"),
            logs: Vec::new(),
        }
    }
}

/// Lowercase, whitespace runs replaced by `-`.
fn slug(name: &str) -> String {
    name.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-")
}
