//! Local model registry.
//!
//! Maps friendly model names to GGUF files under a models directory. The
//! built-in entries ship with the crate; a user registry file can add entries
//! or override built-in ones by name. Entries without a filename are synthetic:
//! they resolve without touching the filesystem and exist for the stub engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::asset::metadata::{inspect, is_gguf, FileMetadata};
use crate::asset::{AssetAuthority, AssetError, AssetProgress};
use crate::config::RegistryConfig;
use crate::protocol::ModelSpec;

const DEFAULT_MODELS: &str = include_str!("models.json");

/// Context window assumed for files that are not in the registry.
const DEFAULT_CONTEXT_LENGTH: u32 = 4096;

#[derive(Debug, Deserialize)]
struct RegistryFile {
    models: Vec<ModelEntry>,
}

/// A single registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Name callers use to request the model.
    pub name: String,

    /// GGUF filename, relative to the models directory (or absolute).
    #[serde(default)]
    pub filename: Option<String>,

    /// Quantization tag. Detected from the filename when absent.
    #[serde(default)]
    pub quantization: Option<String>,

    /// Context window the model was trained with.
    #[serde(default = "default_context_length")]
    pub context_length: u32,
}

fn default_context_length() -> u32 {
    DEFAULT_CONTEXT_LENGTH
}

/// The registry: built-in entries, overlaid with the user's.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// Build the registry from configuration.
    pub fn new(config: &RegistryConfig) -> Result<Self, AssetError> {
        let mut registry = Self {
            models_dir: config.models_dir.clone(),
            entries: BTreeMap::new(),
        };

        registry.merge(parse_registry(DEFAULT_MODELS, "<built-in>")?);

        if let Some(path) = &config.registry_file {
            if path.exists() {
                let data = std::fs::read_to_string(path)?;
                let entries = parse_registry(&data, &path.display().to_string())?;
                info!(path = %path.display(), entries = entries.len(), "Loaded user registry");
                registry.merge(entries);
            } else {
                warn!("Registry file not found at {:?}, using built-in entries", path);
            }
        }

        Ok(registry)
    }

    /// Build a registry from explicit entries only.
    pub fn from_entries(models_dir: impl Into<PathBuf>, entries: Vec<ModelEntry>) -> Self {
        let mut registry = Self {
            models_dir: models_dir.into(),
            entries: BTreeMap::new(),
        };
        registry.merge(entries);
        registry
    }

    fn merge(&mut self, entries: Vec<ModelEntry>) {
        for entry in entries {
            self.entries.insert(entry.name.clone(), entry);
        }
    }

    /// Directory model files are resolved against.
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Resolve a name or a direct GGUF path to a loadable model.
    pub fn resolve(&self, id: &str) -> Result<ModelSpec, AssetError> {
        self.locate(id).map(|(spec, _)| spec)
    }

    /// Resolve, keeping what was learned about the backing file. Synthetic
    /// entries have no file.
    fn locate(&self, id: &str) -> Result<(ModelSpec, Option<FileMetadata>), AssetError> {
        if let Some(entry) = self.entries.get(id) {
            return self.locate_entry(id, entry);
        }

        let direct = Path::new(id);
        if is_gguf(direct) {
            let meta = inspect(id, direct)?;
            let spec = ModelSpec {
                id: id.to_string(),
                path: direct.to_path_buf(),
                quantization: meta
                    .quantization
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                context_size: DEFAULT_CONTEXT_LENGTH,
            };
            return Ok((spec, Some(meta)));
        }

        Err(AssetError::UnknownModel(id.to_string()))
    }

    fn locate_entry(
        &self,
        id: &str,
        entry: &ModelEntry,
    ) -> Result<(ModelSpec, Option<FileMetadata>), AssetError> {
        let Some(filename) = &entry.filename else {
            let spec = ModelSpec {
                id: id.to_string(),
                path: PathBuf::from(id),
                quantization: entry
                    .quantization
                    .clone()
                    .unwrap_or_else(|| "none".to_string()),
                context_size: entry.context_length,
            };
            return Ok((spec, None));
        };

        let path = self.models_dir.join(filename);
        let meta = inspect(id, &path)?;
        let quantization = entry
            .quantization
            .clone()
            .or_else(|| meta.quantization.clone())
            .unwrap_or_else(|| "unknown".to_string());

        let spec = ModelSpec {
            id: id.to_string(),
            path,
            quantization,
            context_size: entry.context_length,
        };
        Ok((spec, Some(meta)))
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

fn parse_registry(data: &str, origin: &str) -> Result<Vec<ModelEntry>, AssetError> {
    serde_json::from_str::<RegistryFile>(data)
        .map(|file| file.models)
        .map_err(|e| AssetError::InvalidRegistry {
            path: origin.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl AssetAuthority for ModelRegistry {
    async fn ensure_model(
        &self,
        id: &str,
        progress: AssetProgress,
    ) -> Result<ModelSpec, AssetError> {
        let (spec, meta) = self.locate(id)?;
        // Local files are complete once found.
        if let Some(meta) = meta {
            progress.report(meta.file_size, meta.file_size);
        }
        Ok(spec)
    }

    async fn list_models(&self) -> Result<Vec<String>, AssetError> {
        Ok(self.names())
    }
}
