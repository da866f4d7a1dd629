//! Runtime configuration for cortex-stem.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Lifecycle policy, engine knobs, registry paths and server settings live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::protocol::InferenceConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "cortex-stem", version, about = "Local-first LLM inference orchestrator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Run the HTTP API.
    Serve {
        /// HTTP listen address (overrides the config file).
        #[arg(long)]
        listen: Option<String>,

        /// Model to load before accepting requests.
        #[arg(long)]
        model: Option<String>,
    },
    /// Interactive chat on stdin.
    Chat {
        #[arg(long)]
        model: Option<String>,

        /// Print reasoning segments.
        #[arg(long)]
        show_thinking: bool,
    },
    /// Run a single prompt and exit.
    Infer {
        prompt: String,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        max_tokens: Option<usize>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        show_thinking: bool,
    },
    /// Print an embedding vector summary for the input text.
    Embed {
        input: String,

        #[arg(long)]
        model: Option<String>,
    },
    /// List models known to the registry.
    Models,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event loop and lifecycle policy.
    pub orchestrator: OrchestratorConfig,

    /// Backend settings.
    pub engine: EngineConfig,

    /// Model registry locations.
    pub registry: RegistryConfig,

    /// HTTP server configuration.
    pub server: ServerConfig,

    /// Defaults applied to requests that carry no explicit config.
    pub inference: InferenceConfig,
}

/// How the resident model is released after use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CortexStrategy {
    /// Unload as soon as an inference completes.
    Immediate,
    /// Unload after this much inactivity in the Loaded state.
    HibernateAfter(Duration),
    /// Never unload automatically.
    KeepAlive,
}

impl Default for CortexStrategy {
    fn default() -> Self {
        CortexStrategy::HibernateAfter(Duration::from_secs(300))
    }
}

impl std::fmt::Display for CortexStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CortexStrategy::Immediate => write!(f, "immediate"),
            CortexStrategy::HibernateAfter(d) => write!(f, "hibernate after {:?}", d),
            CortexStrategy::KeepAlive => write!(f, "keep-alive"),
        }
    }
}

/// Serialized form of [`CortexStrategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Immediate,
    Hibernate,
    KeepAlive,
}

/// Orchestrator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Lifecycle policy.
    pub strategy: StrategyKind,

    /// Inactivity window for the hibernate strategy, in seconds.
    pub hibernate_after_secs: u64,

    /// Upper bound on asset resolution, in seconds.
    pub asset_timeout_secs: u64,

    /// How long a cancelled backend call may take to wind down, in milliseconds.
    pub cancel_grace_ms: u64,

    /// Capacity of the command and output queues.
    pub queue_capacity: usize,

    /// Model used when a request names none and nothing was loaded before.
    pub default_model: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Hibernate,
            hibernate_after_secs: 300,
            asset_timeout_secs: 600,
            cancel_grace_ms: 2000,
            queue_capacity: 32,
            default_model: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn strategy(&self) -> CortexStrategy {
        match self.strategy {
            StrategyKind::Immediate => CortexStrategy::Immediate,
            StrategyKind::Hibernate => {
                CortexStrategy::HibernateAfter(Duration::from_secs(self.hibernate_after_secs))
            }
            StrategyKind::KeepAlive => CortexStrategy::KeepAlive,
        }
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_secs(self.asset_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// Backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Context size used when neither the request nor the model specifies one.
    pub context_size: u32,

    /// Number of GPU layers to offload (real engine).
    pub n_gpu_layers: u32,

    /// Prompt batch size in tokens (real engine).
    pub batch_size: u32,

    /// Decode threads (real engine). Unset = library default.
    pub threads: Option<i32>,

    /// Capacity of each per-request event channel.
    pub event_buffer: usize,

    /// Simulated load latency of the stub engine, in milliseconds.
    pub stub_load_delay_ms: u64,

    /// Simulated delay between stub events, in milliseconds.
    pub stub_token_delay_ms: u64,

    /// Marker opening a reasoning segment.
    pub think_start: String,

    /// Marker closing a reasoning segment.
    pub think_end: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            n_gpu_layers: 0,
            batch_size: 512,
            threads: None,
            event_buffer: 32,
            stub_load_delay_ms: 100,
            stub_token_delay_ms: 50,
            think_start: "<think>".to_string(),
            think_end: "</think>".to_string(),
        }
    }
}

/// Where the registry looks for models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Directory holding GGUF files.
    pub models_dir: PathBuf,

    /// Optional user registry (JSON) merged over the built-in entries.
    pub registry_file: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            registry_file: None,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_strategy_is_five_minute_hibernation() {
        let cfg = Config::default();
        assert_eq!(
            cfg.orchestrator.strategy(),
            CortexStrategy::HibernateAfter(Duration::from_secs(300))
        );
        assert_eq!(CortexStrategy::default(), cfg.orchestrator.strategy());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "orchestrator": { "strategy": "keep_alive" },
            "engine": { "stub_load_delay_ms": 5 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.orchestrator.strategy(), CortexStrategy::KeepAlive);
        assert_eq!(cfg.orchestrator.queue_capacity, 32);
        assert_eq!(cfg.engine.stub_load_delay_ms, 5);
        assert_eq!(cfg.engine.think_start, "<think>");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::load(&tmp.path().join("absent.json")).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:8080");
    }
}
