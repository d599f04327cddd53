//! Loading project manifests from disk.

use serde_json::Value;
use std::path::{Path, PathBuf};

/// Manifest loading error.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("manifest must be a JSON object of path -> content, got {0}")]
    NotAnObject(&'static str),
}

/// Parse a `path -> content` JSON object.
///
/// Values are left as-is; the VFS builder coerces them.
pub fn parse(text: &str) -> Result<Vec<(String, Value)>, ManifestError> {
    match serde_json::from_str(text)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Array(_) => Err(ManifestError::NotAnObject("an array")),
        Value::String(_) => Err(ManifestError::NotAnObject("a string")),
        Value::Number(_) => Err(ManifestError::NotAnObject("a number")),
        Value::Bool(_) => Err(ManifestError::NotAnObject("a boolean")),
        Value::Null => Err(ManifestError::NotAnObject("null")),
    }
}

/// Read and parse a manifest file.
pub async fn load(path: &Path) -> Result<Vec<(String, Value)>, ManifestError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    let files = parse(&text)?;
    tracing::debug!(path = %path.display(), entries = files.len(), "Manifest loaded");
    Ok(files)
}
