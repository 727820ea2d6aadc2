//! Persistence record shapes: projects, generation audit entries and
//! collaboration sessions.
//!
//! `New*` types are what callers hand to `create`, `*Patch` types are what
//! they hand to `update-by-id`. Unset patch fields leave the stored value
//! untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::generation::{GenerationContext, GenerationResponse, ModelId, PerformanceMetrics};

// ───────────────────────────────────────────────────────────────────
// Projects & deployment
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployProvider {
    Netlify,
    Vercel,
    Cloudflare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    React,
    Vue,
    Svelte,
    Astro,
}

/// How a project is built and where it is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub provider: DeployProvider,
    pub build_command: String,
    pub output_dir: String,
    #[serde(default)]
    pub environment_variables: std::collections::BTreeMap<String, String>,
    pub framework: Option<Framework>,
    pub node_version: Option<String>,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            provider: DeployProvider::Netlify,
            build_command: "npm run build".to_string(),
            output_dir: "dist".to_string(),
            environment_variables: Default::default(),
            framework: Some(Framework::React),
            node_version: Some("18.x".to_string()),
        }
    }
}

/// Deployment bookkeeping stored on the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentData {
    pub config: Option<DeploymentConfig>,
    pub last_deployment: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub settings: serde_json::Value,
    pub is_public: bool,
    pub deployment_data: DeploymentData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub settings: Option<serde_json::Value>,
    pub is_public: Option<bool>,
    pub deployment_data: Option<DeploymentData>,
}

// ───────────────────────────────────────────────────────────────────
// Generation audit
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub prompt: String,
    /// Requested model. The model that answered lives in `response`.
    pub model: ModelId,
    pub context: Option<GenerationContext>,
    pub response: Option<GenerationResponse>,
    pub performance: Option<PerformanceMetrics>,
    pub attribution: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGeneration {
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub prompt: String,
    pub model: ModelId,
    pub context: Option<GenerationContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationPatch {
    pub response: Option<GenerationResponse>,
    pub performance: Option<PerformanceMetrics>,
    pub attribution: Option<Vec<String>>,
}

impl GenerationPatch {
    /// Patch carrying a finished response and its metrics.
    pub fn completed(response: &GenerationResponse) -> Self {
        Self {
            performance: Some(response.performance),
            attribution: Some(response.attribution.clone()),
            response: Some(response.clone()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Collaboration sessions
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Owner,
    Editor,
    Viewer,
}

/// Zero-based line/column of a participant's caret.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorLocation {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub name: String,
    pub role: ParticipantRole,
    pub cursor: Option<CursorLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub participants: Vec<Participant>,
    pub active_file: Option<String>,
    pub chat: Vec<ChatEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPatch {
    pub participants: Option<Vec<Participant>>,
    pub active_file: Option<Option<String>>,
    pub chat: Option<Vec<ChatEntry>>,
    pub ended_at: Option<DateTime<Utc>>,
}
