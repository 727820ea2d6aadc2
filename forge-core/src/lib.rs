//! # forge-core: shared data contracts for Forge
//!
//! Types every other crate agrees on: generation requests and responses,
//! persistence records, the [`RecordStore`] collaborator and the
//! documentation search stub.

pub mod generation;
pub mod records;
pub mod search;
pub mod store;

pub use generation::{
    FallbackNotice, FileSnapshot, GenerationContext, GenerationRequest, GenerationResponse,
    ModelId, PerformanceMetrics, SamplingParams, UnknownModel, DEFAULT_MAX_TOKENS,
    DEFAULT_TEMPERATURE,
};
pub use records::{
    ChatEntry, CursorLocation, DeployProvider, DeploymentConfig, DeploymentData, Framework,
    GenerationPatch, GenerationRecord, NewGeneration, NewProject, Participant, ParticipantRole,
    ProjectPatch, ProjectRecord, SessionPatch, SessionRecord,
};
pub use search::{DocMatch, DocsIndex, Embedder, TechnicalDoc, ZeroEmbedder};
pub use store::{MemoryStore, PersistenceError, RecordStore};
