//! # forge-gen: code generation with deadline fallback
//!
//! A request goes to the model it names. If that model has not answered
//! when the deadline fires, the request is re-issued to the next model in
//! the rotation and the rotation stays on that model for later requests.
//! A rejected call is surfaced as is and never triggers a fallback.

pub mod backend;
pub mod error;
pub mod orchestrator;
pub mod rotation;

pub use backend::{BackendCall, Completion, ModelBackend, StubBackend, StubBehavior};
pub use error::{BackendError, GenerationError};
pub use orchestrator::{AttemptId, AuditScope, Orchestrator, OrchestratorConfig, DEFAULT_DEADLINE};
pub use rotation::ModelRotation;
