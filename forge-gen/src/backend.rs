//! The model backend seam and the stub that stands in for real inference.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use forge_core::{GenerationRequest, ModelId};
use tokio::time::Instant;

use crate::error::BackendError;

pub const MOCK_CODE: &str = "// Generated code\nconsole.log(\"Hello, World!\");";
pub const MOCK_EXPLANATION: &str = "This is a mock response.";
pub const MOCK_TOKENS: u32 = 100;

/// What a backend returns for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: String,
    pub explanation: Option<String>,
    pub tests: Option<String>,
    pub attribution: Vec<String>,
    pub tokens: u32,
}

impl Completion {
    pub fn mock() -> Self {
        Self {
            code: MOCK_CODE.to_string(),
            explanation: Some(MOCK_EXPLANATION.to_string()),
            tests: None,
            attribution: Vec::new(),
            tokens: MOCK_TOKENS,
        }
    }
}

/// A code generation model. Latency is unbounded from the caller's side.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn invoke(
        &self,
        request: &GenerationRequest,
        model: ModelId,
    ) -> Result<Completion, BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubBehavior {
    Respond { delay: Duration },
    Fail { delay: Duration, message: String },
    /// Never settles.
    Hang,
}

impl Default for StubBehavior {
    fn default() -> Self {
        StubBehavior::Respond { delay: Duration::ZERO }
    }
}

/// One observed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCall {
    pub model: ModelId,
    pub at: Instant,
}

/// Returns the canned mock completion, with per-model latency and failure
/// injection.
#[derive(Debug, Default)]
pub struct StubBackend {
    behaviors: HashMap<ModelId, StubBehavior>,
    calls: Mutex<Vec<BackendCall>>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, model: ModelId, behavior: StubBehavior) -> Self {
        self.behaviors.insert(model, behavior);
        self
    }

    pub fn with_delay(self, model: ModelId, delay: Duration) -> Self {
        self.with_behavior(model, StubBehavior::Respond { delay })
    }

    pub fn failing(self, model: ModelId, message: impl Into<String>) -> Self {
        self.with_behavior(
            model,
            StubBehavior::Fail {
                delay: Duration::ZERO,
                message: message.into(),
            },
        )
    }

    pub fn hanging(self, model: ModelId) -> Self {
        self.with_behavior(model, StubBehavior::Hang)
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ModelBackend for StubBackend {
    async fn invoke(
        &self,
        request: &GenerationRequest,
        model: ModelId,
    ) -> Result<Completion, BackendError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(BackendCall {
                model,
                at: Instant::now(),
            });
        }
        log::debug!("stub {model}: {} prompt chars", request.prompt.len());

        match self.behaviors.get(&model).cloned().unwrap_or_default() {
            StubBehavior::Respond { delay } => {
                tokio::time::sleep(delay).await;
                Ok(Completion::mock())
            }
            StubBehavior::Fail { delay, message } => {
                tokio::time::sleep(delay).await;
                Err(BackendError::Rejected { model, message })
            }
            StubBehavior::Hang => std::future::pending().await,
        }
    }
}
