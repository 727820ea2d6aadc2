use std::time::Duration;

use forge_core::ModelId;

/// A model call that did not produce a completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{model} rejected the request: {message}")]
    Rejected { model: ModelId, message: String },
    #[error("{0} is unavailable")]
    Unavailable(ModelId),
}

impl BackendError {
    pub fn model(&self) -> ModelId {
        match self {
            BackendError::Rejected { model, .. } => *model,
            BackendError::Unavailable(model) => *model,
        }
    }
}

/// Failures surfaced by [`crate::Orchestrator::generate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// The deadline passed and no fallback was allowed.
    #[error("{model} did not answer within {deadline:?}")]
    Timeout { model: ModelId, deadline: Duration },

    /// The model call rejected. The rotation is left where it was.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Every permitted fallback missed its deadline too.
    #[error("no model answered in time (tried {})", display_models(.tried))]
    Exhausted { tried: Vec<ModelId> },

    #[error("the model rotation is empty")]
    EmptyRotation,
}

fn display_models(models: &[ModelId]) -> String {
    models.iter().map(ModelId::as_str).collect::<Vec<_>>().join(", ")
}
