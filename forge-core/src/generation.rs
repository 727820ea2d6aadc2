//! Generation request/response contracts shared by the orchestrator,
//! the shell and the audit records.
//!
//! A [`GenerationRequest`] is immutable once issued: the orchestrator only
//! ever reads it, and a fallback attempt re-issues the same request against
//! a different [`ModelId`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default upper bound on generated tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 8000;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Backend model identifiers, in the order of the default fallback rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "GPT4")]
    Gpt4,
    #[serde(rename = "CLAUDE")]
    Claude,
    #[serde(rename = "CODEQWEN")]
    CodeQwen,
}

impl ModelId {
    /// The fixed rotation `[GPT4, CLAUDE, CODEQWEN]`.
    pub const ROTATION: [ModelId; 3] = [ModelId::Gpt4, ModelId::Claude, ModelId::CodeQwen];

    /// Wire/display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::Gpt4 => "GPT4",
            ModelId::Claude => "CLAUDE",
            ModelId::CodeQwen => "CODEQWEN",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown model name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown model `{0}` (expected GPT4, CLAUDE or CODEQWEN)")]
pub struct UnknownModel(pub String);

impl FromStr for ModelId {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GPT4" => Ok(ModelId::Gpt4),
            "CLAUDE" => Ok(ModelId::Claude),
            "CODEQWEN" => Ok(ModelId::CodeQwen),
            _ => Err(UnknownModel(s.to_string())),
        }
    }
}

/// Sampling parameters forwarded verbatim to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    /// In `[0, 1]`.
    pub temperature: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl SamplingParams {
    /// Clamp the temperature into `[0, 1]`.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// One file of editor context attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub path: String,
    pub content: String,
}

/// Optional file-context snapshot captured when the request is issued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationContext {
    pub files: Vec<FileSnapshot>,
    pub language: Option<String>,
    pub framework: Option<String>,
}

impl GenerationContext {
    /// Context holding a single file.
    pub fn single_file(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            files: vec![FileSnapshot {
                path: path.into(),
                content: content.into(),
            }],
            language: None,
            framework: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(FileSnapshot {
            path: path.into(),
            content: content.into(),
        });
        self
    }
}

/// A code-generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Model the caller asked for. A fallback never rewrites this field.
    pub model: ModelId,
    pub context: Option<GenerationContext>,
    pub sampling: SamplingParams,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, model: ModelId) -> Self {
        Self {
            prompt: prompt.into(),
            model,
            context: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_context(mut self, context: GenerationContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Latency and token accounting for a completed generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Wall time from issue to accepted result, in milliseconds.
    pub latency_ms: u64,
    pub tokens: u32,
}

/// Recorded when the primary model missed its deadline and a fallback
/// model produced (or was asked to produce) the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackNotice {
    pub from: ModelId,
    pub to: ModelId,
    /// Deadline the `from` model missed.
    #[serde(with = "duration_ms")]
    pub deadline: Duration,
}

/// Result of a completed (possibly fallback-completed) generation.
///
/// Never mutated after being returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub code: String,
    pub explanation: Option<String>,
    pub tests: Option<String>,
    pub attribution: Vec<String>,
    /// Model that actually produced the result.
    pub model: ModelId,
    pub performance: PerformanceMetrics,
    /// Model switches that happened on the way to this result.
    pub fallbacks: Vec<FallbackNotice>,
}

impl GenerationResponse {
    /// Whether the result came from a model other than the requested one.
    pub fn used_fallback(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    /// Transcript rendering: code, then the explanation after a blank line.
    pub fn transcript_text(&self) -> String {
        match &self.explanation {
            Some(explanation) if !explanation.is_empty() => {
                format!("{}\n\n{}", self.code, explanation)
            }
            _ => self.code.clone(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_defaults() {
        let params = SamplingParams::default();
        assert_eq!(params.max_tokens, 8000);
        assert!((params.temperature - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_temperature_clamped() {
        let params = SamplingParams::default().with_temperature(3.5);
        assert_eq!(params.temperature, 1.0);
        let params = SamplingParams::default().with_temperature(-1.0);
        assert_eq!(params.temperature, 0.0);
    }

    #[test]
    fn test_model_wire_names() {
        let json = serde_json::to_string(&ModelId::CodeQwen).unwrap();
        assert_eq!(json, "\"CODEQWEN\"");
        let parsed: ModelId = serde_json::from_str("\"CLAUDE\"").unwrap();
        assert_eq!(parsed, ModelId::Claude);
    }

    #[test]
    fn test_model_from_str() {
        assert_eq!("gpt4".parse::<ModelId>().unwrap(), ModelId::Gpt4);
        assert_eq!(" CodeQwen ".parse::<ModelId>().unwrap(), ModelId::CodeQwen);
        assert!("llama".parse::<ModelId>().is_err());
    }

    #[test]
    fn test_request_defaults() {
        let req = GenerationRequest::new("write a parser", ModelId::Gpt4);
        assert_eq!(req.sampling, SamplingParams::default());
        assert!(req.context.is_none());
    }

    #[test]
    fn test_transcript_text() {
        let mut resp = GenerationResponse {
            code: "fn main() {}".into(),
            explanation: Some("Entry point.".into()),
            tests: None,
            attribution: Vec::new(),
            model: ModelId::Claude,
            performance: PerformanceMetrics::default(),
            fallbacks: Vec::new(),
        };
        assert_eq!(resp.transcript_text(), "fn main() {}\n\nEntry point.");

        resp.explanation = None;
        assert_eq!(resp.transcript_text(), "fn main() {}");
        assert!(!resp.used_fallback());
    }
}
