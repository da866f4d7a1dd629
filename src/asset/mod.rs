//! Model asset resolution.
//!
//! - [`registry`]: Local model registry (built-in entries + user file)
//! - [`metadata`]: GGUF file inspection and quantization detection

pub mod metadata;
pub mod registry;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{ErrorEvent, ErrorKind, ModelSpec};

#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Model '{0}' not found in registry")]
    UnknownModel(String),

    #[error("Model '{id}' is not available locally at {path}")]
    NotAvailable { id: String, path: String },

    #[error("Invalid registry file {path}: {reason}")]
    InvalidRegistry { path: String, reason: String },

    #[error("Asset resolution for '{0}' timed out")]
    Timeout(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<AssetError> for ErrorEvent {
    fn from(err: AssetError) -> Self {
        Self {
            kind: ErrorKind::Asset,
            message: err.to_string(),
        }
    }
}

/// Byte counts reported while an authority makes a model available.
#[derive(Debug, Clone)]
pub struct AssetProgress(Option<mpsc::UnboundedSender<(u64, u64)>>);

impl AssetProgress {
    /// A reporter and the receiver its `(done, total)` pairs arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<(u64, u64)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(Some(tx)), rx)
    }

    /// A reporter nobody listens to.
    pub fn ignored() -> Self {
        Self(None)
    }

    pub fn report(&self, done: u64, total: u64) {
        if let Some(tx) = &self.0 {
            let _ = tx.send((done, total));
        }
    }
}

/// Turns model identifiers into local, loadable model descriptions.
#[async_trait]
pub trait AssetAuthority: Send + Sync {
    /// Resolve `id` to a local model, fetching it if the authority can.
    /// Bytes made available along the way go to `progress`.
    async fn ensure_model(
        &self,
        id: &str,
        progress: AssetProgress,
    ) -> Result<ModelSpec, AssetError>;

    /// Identifiers this authority knows about.
    async fn list_models(&self) -> Result<Vec<String>, AssetError>;
}
