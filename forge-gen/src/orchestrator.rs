//! Deadline-hedged generation.
//!
//! ```text
//! IDLE ──► IN_FLIGHT(model) ──► SUCCEEDED
//!               │ deadline
//!               ▼
//!          IN_FLIGHT(next) ──► SUCCEEDED | EXHAUSTED
//! ```
//!
//! Every attempt runs as its own task and reports back over one channel
//! tagged with its [`AttemptId`]. Only the current attempt's result is
//! accepted. A superseded attempt that settles late is logged and dropped,
//! and any attempt still running when `generate` returns is aborted.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_core::{
    FallbackNotice, GenerationPatch, GenerationRequest, GenerationResponse, ModelId, NewGeneration,
    PerformanceMetrics, RecordStore,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backend::{Completion, ModelBackend};
use crate::error::{BackendError, GenerationError};
use crate::rotation::ModelRotation;

/// Default deadline for the first attempt.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub deadline: Duration,
    /// Race fallback attempts against the deadline too.
    pub rearm_fallback_deadline: bool,
    pub max_fallbacks: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            deadline: DEFAULT_DEADLINE,
            rearm_fallback_deadline: false,
            max_fallbacks: 1,
        }
    }
}

/// Identifies one model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who an audit record is filed under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditScope {
    pub project_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

struct Outcome {
    attempt: AttemptId,
    model: ModelId,
    result: Result<Completion, BackendError>,
}

pub struct Orchestrator {
    backend: Arc<dyn ModelBackend>,
    config: OrchestratorConfig,
    rotation: Mutex<ModelRotation>,
    next_attempt: AtomicU64,
    audit: Option<(Arc<dyn RecordStore>, AuditScope)>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, config: OrchestratorConfig) -> Self {
        Self {
            backend,
            config,
            rotation: Mutex::new(ModelRotation::default()),
            next_attempt: AtomicU64::new(1),
            audit: None,
        }
    }

    pub fn with_defaults(backend: Arc<dyn ModelBackend>) -> Self {
        Self::new(backend, OrchestratorConfig::default())
    }

    pub fn with_rotation(mut self, rotation: ModelRotation) -> Self {
        self.rotation = Mutex::new(rotation);
        self
    }

    /// Record every generation in `store`.
    pub fn with_audit(mut self, store: Arc<dyn RecordStore>, scope: AuditScope) -> Self {
        self.audit = Some((store, scope));
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Snapshot of the rotation state.
    pub fn rotation(&self) -> ModelRotation {
        match self.rotation.lock() {
            Ok(rotation) => rotation.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The model new requests should name. A fallback moves it.
    pub fn current_model(&self) -> ModelId {
        self.rotation().current()
    }

    /// Explicit user selection. Returns false for a model outside the
    /// rotation.
    pub fn select_model(&self, model: ModelId) -> bool {
        match self.rotation.lock() {
            Ok(mut rotation) => rotation.select(model),
            Err(_) => false,
        }
    }

    /// Generate with the configured deadline.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, GenerationError> {
        self.generate_with_deadline(request, self.config.deadline).await
    }

    pub async fn generate_with_deadline(
        &self,
        request: GenerationRequest,
        deadline: Duration,
    ) -> Result<GenerationResponse, GenerationError> {
        let started = Instant::now();
        let audit_id = self.audit_start(&request).await;
        let request = Arc::new(request);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();
        let mut model = request.model;
        let mut current = self.spawn_attempt(&request, model, &tx, &mut tasks);
        let mut fallbacks: Vec<FallbackNotice> = Vec::new();
        let mut tried = vec![model];

        let result = loop {
            let raced = fallbacks.is_empty() || self.config.rearm_fallback_deadline;
            let settled = if raced {
                tokio::time::timeout(deadline, await_attempt(&mut rx, current, model)).await.ok()
            } else {
                Some(await_attempt(&mut rx, current, model).await)
            };

            match settled {
                Some(Ok(completion)) => break Ok((model, completion)),
                Some(Err(e)) => {
                    log::warn!("generation attempt {current} on {model} failed: {e}");
                    break Err(GenerationError::Backend(e));
                }
                None if fallbacks.len() >= self.config.max_fallbacks => {
                    log::warn!("{model} missed its {deadline:?} deadline, no fallback left");
                    break Err(if fallbacks.is_empty() {
                        GenerationError::Timeout { model, deadline }
                    } else {
                        GenerationError::Exhausted { tried }
                    });
                }
                None => {
                    let next = self.advance_rotation(model);
                    log::warn!("{model} missed its {deadline:?} deadline, switching to {next}");
                    fallbacks.push(FallbackNotice {
                        from: model,
                        to: next,
                        deadline,
                    });
                    model = next;
                    tried.push(next);
                    current = self.spawn_attempt(&request, model, &tx, &mut tasks);
                }
            }
        };

        for task in tasks {
            task.abort();
        }

        let (model, completion) = result?;
        let response = GenerationResponse {
            code: completion.code,
            explanation: completion.explanation,
            tests: completion.tests,
            attribution: completion.attribution,
            model,
            performance: PerformanceMetrics {
                latency_ms: started.elapsed().as_millis() as u64,
                tokens: completion.tokens,
            },
            fallbacks,
        };
        if let Some(id) = audit_id {
            self.audit_finish(id, &response).await;
        }
        Ok(response)
    }

    fn spawn_attempt(
        &self,
        request: &Arc<GenerationRequest>,
        model: ModelId,
        tx: &mpsc::UnboundedSender<Outcome>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> AttemptId {
        let attempt = AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed));
        let backend = self.backend.clone();
        let request = request.clone();
        let tx = tx.clone();
        log::debug!("generation attempt {attempt} issued to {model}");

        tasks.push(tokio::spawn(async move {
            let result = backend.invoke(&request, model).await;
            // The receiver is gone once generate has returned.
            let _ = tx.send(Outcome {
                attempt,
                model,
                result,
            });
        }));
        attempt
    }

    fn advance_rotation(&self, from: ModelId) -> ModelId {
        match self.rotation.lock() {
            Ok(mut rotation) => rotation.advance_from(from),
            Err(poisoned) => poisoned.into_inner().advance_from(from),
        }
    }

    async fn audit_start(&self, request: &GenerationRequest) -> Option<Uuid> {
        let (store, scope) = self.audit.as_ref()?;
        let new = NewGeneration {
            project_id: scope.project_id,
            user_id: scope.user_id,
            prompt: request.prompt.clone(),
            model: request.model,
            context: request.context.clone(),
        };
        match store.create_generation(new).await {
            Ok(record) => Some(record.id),
            Err(e) => {
                log::warn!("generation audit record not created: {e}");
                None
            }
        }
    }

    async fn audit_finish(&self, id: Uuid, response: &GenerationResponse) {
        let Some((store, _)) = self.audit.as_ref() else {
            return;
        };
        if let Err(e) = store.update_generation(id, GenerationPatch::completed(response)).await {
            log::warn!("generation audit record {id} not updated: {e}");
        }
    }
}

/// Wait for `current` to settle, discarding anything older.
async fn await_attempt(
    rx: &mut mpsc::UnboundedReceiver<Outcome>,
    current: AttemptId,
    model: ModelId,
) -> Result<Completion, BackendError> {
    loop {
        match rx.recv().await {
            Some(outcome) if outcome.attempt == current => return outcome.result,
            Some(stale) => {
                log::debug!(
                    "discarding stale result of attempt {} from {} (current is {current})",
                    stale.attempt,
                    stale.model
                );
            }
            None => return Err(BackendError::Unavailable(model)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.deadline, Duration::from_secs(15));
        assert!(!config.rearm_fallback_deadline);
        assert_eq!(config.max_fallbacks, 1);
    }

    #[test]
    fn test_attempt_id_display() {
        assert_eq!(AttemptId(7).to_string(), "#7");
    }

    #[test]
    fn test_select_model() {
        let orchestrator = Orchestrator::with_defaults(Arc::new(StubBackend::new()));
        assert_eq!(orchestrator.current_model(), ModelId::Gpt4);
        assert!(orchestrator.select_model(ModelId::CodeQwen));
        assert_eq!(orchestrator.current_model(), ModelId::CodeQwen);
    }

    #[tokio::test]
    async fn test_immediate_answer() {
        let orchestrator = Orchestrator::with_defaults(Arc::new(StubBackend::new()));
        let response = orchestrator
            .generate(GenerationRequest::new("say hi", ModelId::Gpt4))
            .await
            .unwrap();
        assert_eq!(response.model, ModelId::Gpt4);
        assert_eq!(response.performance.tokens, 100);
        assert_eq!(response.explanation.as_deref(), Some("This is a mock response."));
        assert!(!response.used_fallback());
    }
}
