//! Helpers for sanitizing data before it enters tracing span attributes.
//!
//! Case media paths often carry names of people and matters; spans only
//! ever see file names.

use std::path::{Path, PathBuf};

/// Returns only the filename component of a path (no directory).
///
/// Safe for span fields: reveals the file name without exposing the full path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Comma-separated file names of a batch.
pub fn redact_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| redact_path(p))
        .collect::<Vec<_>>()
        .join(",")
}
