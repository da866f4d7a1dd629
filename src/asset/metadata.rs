//! GGUF file inspection.
//!
//! Derives the quantization tag and a context-window hint for a model file.
//! Only the filename is consulted; the GGUF header is left to the engine.

use std::path::Path;

use tracing::debug;

use crate::asset::AssetError;

/// What the registry learns about a model file before it is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File size in bytes.
    pub file_size: u64,

    /// Quantization type string, if it can be read off the filename.
    pub quantization: Option<String>,
}

const QUANT_TAGS: &[&str] = &[
    "IQ4_XS", "IQ4_NL", "Q2_K", "Q3_K_S", "Q3_K_M", "Q3_K_L", "Q4_K_S", "Q4_K_M", "Q4_0", "Q4_1",
    "Q5_K_S", "Q5_K_M", "Q5_0", "Q5_1", "Q6_K", "Q8_0", "BF16", "F16", "F32",
];

/// Detect the quantization tag from a model filename.
///
/// Longer tags are listed before their prefixes so "Q4_K_M" wins over "Q4_K".
pub fn detect_quantization(path: &Path) -> Option<String> {
    let filename = path.file_name()?.to_str()?.to_uppercase();
    QUANT_TAGS
        .iter()
        .find(|tag| filename.contains(*tag))
        .map(|tag| tag.to_string())
}

/// Whether a path looks like a GGUF model file.
pub fn is_gguf(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Inspect a model file on disk.
pub fn inspect(id: &str, path: &Path) -> Result<FileMetadata, AssetError> {
    if !path.is_file() {
        return Err(AssetError::NotAvailable {
            id: id.to_string(),
            path: path.display().to_string(),
        });
    }

    let file_size = std::fs::metadata(path)?.len();
    let metadata = FileMetadata {
        file_size,
        quantization: detect_quantization(path),
    };

    debug!(
        model = id,
        path = %path.display(),
        size = file_size,
        quant = ?metadata.quantization,
        "Inspected model file"
    );

    Ok(metadata)
}
