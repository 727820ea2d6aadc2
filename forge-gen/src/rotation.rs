//! Fallback rotation: an ordered, wrapping list of models plus the index
//! of the one currently selected.

use forge_core::ModelId;

use crate::error::GenerationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRotation {
    models: Vec<ModelId>,
    current: usize,
}

impl Default for ModelRotation {
    /// `[GPT4, CLAUDE, CODEQWEN]`, starting at GPT4.
    fn default() -> Self {
        Self {
            models: ModelId::ROTATION.to_vec(),
            current: 0,
        }
    }
}

impl ModelRotation {
    pub fn new(models: Vec<ModelId>) -> Result<Self, GenerationError> {
        if models.is_empty() {
            return Err(GenerationError::EmptyRotation);
        }
        Ok(Self { models, current: 0 })
    }

    pub fn models(&self) -> &[ModelId] {
        &self.models
    }

    pub fn index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> ModelId {
        self.models[self.current]
    }

    /// The model after `model`, wrapping. A model outside the rotation is
    /// followed by the one after the current selection.
    pub fn next_after(&self, model: ModelId) -> ModelId {
        self.models[self.next_index(model)]
    }

    /// Move the selection to the model after `from` and return it.
    pub(crate) fn advance_from(&mut self, from: ModelId) -> ModelId {
        self.current = self.next_index(from);
        self.current()
    }

    /// Explicit user choice. Returns false for a model outside the rotation.
    pub(crate) fn select(&mut self, model: ModelId) -> bool {
        match self.position(model) {
            Some(i) => {
                self.current = i;
                true
            }
            None => false,
        }
    }

    fn position(&self, model: ModelId) -> Option<usize> {
        self.models.iter().position(|m| *m == model)
    }

    fn next_index(&self, model: ModelId) -> usize {
        let base = self.position(model).unwrap_or(self.current);
        (base + 1) % self.models.len()
    }
}
