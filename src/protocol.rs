//! Shared vocabulary between callers, the orchestrator, and engine backends.
//!
//! Everything here is plain data: commands flow in, outputs flow out, and
//! every output carries the correlation id of the request that produced it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed command or configuration. Rejected before any state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid temperature {0}: must be finite and non-negative")]
    InvalidTemperature(f32),

    #[error("max_tokens must be greater than zero")]
    ZeroMaxTokens,

    #[error("context_size must be greater than zero")]
    ZeroContextSize,

    #[error("Empty {0}")]
    EmptyInput(&'static str),

    #[error("No model specified and no default model configured")]
    NoModel,
}

/// A resolved, immutable description of a model instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier the model was requested by.
    pub id: String,

    /// Local file holding the weights.
    pub path: PathBuf,

    /// Quantization tag (e.g. "Q4_K_M").
    pub quantization: String,

    /// Context window in tokens.
    pub context_size: u32,
}

/// Per-request sampling and output behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Sampling temperature (0.0 = greedy).
    pub temperature: f32,

    /// Upper bound on generated tokens.
    pub max_tokens: usize,

    /// Surface reasoning segments as Thought events.
    pub show_thinking: bool,

    /// Overrides the model's context window for this request.
    pub context_size: Option<u32>,

    /// Sampler seed. Unset means a fixed default seed.
    pub seed: Option<u32>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 512,
            show_thinking: false,
            context_size: None,
            seed: None,
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ProtocolError::InvalidTemperature(self.temperature));
        }
        if self.max_tokens == 0 {
            return Err(ProtocolError::ZeroMaxTokens);
        }
        if self.context_size == Some(0) {
            return Err(ProtocolError::ZeroContextSize);
        }
        Ok(())
    }
}

/// Reasoning segment markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThoughtEvent {
    Start,
    Delta(String),
    Stop,
}

/// Events produced by a backend for a single request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InferenceEvent {
    ProcessStart,
    Thought(ThoughtEvent),
    Content(String),
    Embedding(Vec<f32>),
    Complete,
}

/// Progress of asset resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetEvent {
    /// Resolution started for the given identifier.
    Started(String),
    /// Bytes available so far and total (0 if unknown).
    Progress(u64, u64),
    /// Asset available at the given local path.
    Complete(String),
    /// Resolution failed.
    Error(String),
}

/// Commands accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    LoadModel(String),
    Infer {
        model: Option<String>,
        prompt: String,
        config: InferenceConfig,
    },
    Embed {
        model: Option<String>,
        input: String,
        config: InferenceConfig,
    },
    ListModels,
    /// Unload the resident model and forget which model was last used.
    Reset,
    /// Abandon an in-flight or queued request.
    Cancel { target: String },
    Stop,
}

impl Command {
    /// Static checks that need no engine state.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Command::LoadModel(id) if id.trim().is_empty() => {
                Err(ProtocolError::EmptyInput("model identifier"))
            }
            Command::Infer { prompt, config, .. } => {
                if prompt.is_empty() {
                    return Err(ProtocolError::EmptyInput("prompt"));
                }
                config.validate()
            }
            Command::Embed { input, config, .. } => {
                if input.is_empty() {
                    return Err(ProtocolError::EmptyInput("embedding input"));
                }
                config.validate()
            }
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::LoadModel(_) => "load_model",
            Command::Infer { .. } => "infer",
            Command::Embed { .. } => "embed",
            Command::ListModels => "list_models",
            Command::Reset => "reset",
            Command::Cancel { .. } => "cancel",
            Command::Stop => "stop",
        }
    }
}

/// A command plus the caller's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Option<String>,
    pub command: Command,
}

impl Request {
    pub fn with_id(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: Some(id.into()),
            command,
        }
    }
}

/// Lifecycle state of the resident engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Unloaded,
    Loading,
    Loaded,
    Inferring,
}

impl EngineState {
    /// Whether a model is resident in this state.
    pub fn is_resident(&self) -> bool {
        matches!(self, EngineState::Loaded | EngineState::Inferring)
    }

    /// Numeric encoding used by the state gauge.
    pub fn as_gauge(&self) -> i64 {
        match self {
            EngineState::Unloaded => 0,
            EngineState::Loading => 1,
            EngineState::Loaded => 2,
            EngineState::Inferring => 3,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Unloaded => write!(f, "unloaded"),
            EngineState::Loading => write!(f, "loading"),
            EngineState::Loaded => write!(f, "loaded"),
            EngineState::Inferring => write!(f, "inferring"),
        }
    }
}

/// Error discriminant surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Asset,
    Engine,
    Protocol,
}

/// A typed error report. `message` keeps the diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ProtocolError> for ErrorEvent {
    fn from(err: ProtocolError) -> Self {
        Self {
            kind: ErrorKind::Protocol,
            message: err.to_string(),
        }
    }
}

/// Body of an orchestrator output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputBody {
    Event(InferenceEvent),
    Asset(AssetEvent),
    Error(ErrorEvent),
    /// Engine lifecycle transition. Always published without a correlation id.
    State(EngineState),
    /// Reply to an explicit LoadModel.
    Loaded(ModelSpec),
    /// Reply to ListModels.
    Models(Vec<String>),
    /// Reply to Reset, Cancel and Stop.
    Ack,
}

impl OutputBody {
    /// Whether this body ends the response to a request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputBody::Event(InferenceEvent::Complete)
                | OutputBody::Error(_)
                | OutputBody::Loaded(_)
                | OutputBody::Models(_)
                | OutputBody::Ack
        )
    }
}

/// One item on the outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: Option<String>,
    pub body: OutputBody,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = InferenceConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.show_thinking);
    }

    #[test]
    fn test_config_validation() {
        let mut config = InferenceConfig::default();
        config.temperature = f32::NAN;
        assert!(matches!(
            config.validate(),
            Err(ProtocolError::InvalidTemperature(_))
        ));

        let config = InferenceConfig {
            max_tokens: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ProtocolError::ZeroMaxTokens));

        let config = InferenceConfig {
            context_size: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ProtocolError::ZeroContextSize));
    }

    #[test]
    fn test_command_validation() {
        let cmd = Command::Infer {
            model: None,
            prompt: String::new(),
            config: InferenceConfig::default(),
        };
        assert_eq!(cmd.validate(), Err(ProtocolError::EmptyInput("prompt")));
        assert!(Command::LoadModel("  ".into()).validate().is_err());
        assert!(Command::ListModels.validate().is_ok());
    }

    #[test]
    fn test_terminal_bodies() {
        assert!(OutputBody::Event(InferenceEvent::Complete).is_terminal());
        assert!(OutputBody::Ack.is_terminal());
        assert!(!OutputBody::Event(InferenceEvent::ProcessStart).is_terminal());
        assert!(!OutputBody::Asset(AssetEvent::Started("m".into())).is_terminal());
        assert!(!OutputBody::State(EngineState::Loaded).is_terminal());
    }

    #[test]
    fn test_resident_states() {
        assert!(EngineState::Loaded.is_resident());
        assert!(EngineState::Inferring.is_resident());
        assert!(!EngineState::Loading.is_resident());
        assert!(!EngineState::Unloaded.is_resident());
    }

    #[test]
    fn test_partial_config_json_uses_defaults() {
        let config: InferenceConfig = serde_json::from_str(r#"{"show_thinking": true}"#).unwrap();
        assert!(config.show_thinking);
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.temperature, 0.7);
    }
}
