//! Encoding of cached file names exchanged with the controller.
//!
//! A cached file is identified by its path relative to the step workspace,
//! base64 (standard alphabet) encoded so it can travel as a single path
//! segment or multipart file name.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheNameError {
    #[error("Invalid cache name encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Cache name is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Cache name '{0}' escapes the workspace")]
    Escapes(String),
}

/// Encodes `full_path` relative to `workspace`.
pub fn encode_cache_name(workspace: &str, full_path: &str) -> String {
    let relative = full_path.strip_prefix(workspace).unwrap_or(full_path);
    let relative = relative.trim_start_matches(['/', '\\']);
    STANDARD.encode(relative.as_bytes())
}

/// Decodes a name produced by [`encode_cache_name`] back to the relative path.
pub fn decode_cache_name(name: &str) -> Result<String, CacheNameError> {
    let bytes = STANDARD.decode(name)?;
    Ok(String::from_utf8(bytes)?)
}

/// Resolves an encoded name to a destination under `dest_dir`, rejecting parent traversal.
pub fn cache_destination(dest_dir: &Path, name: &str) -> Result<PathBuf, CacheNameError> {
    let relative = decode_cache_name(name)?;
    let relative_path = Path::new(&relative);
    let escapes = relative_path
        .components()
        .any(|component| matches!(component, std::path::Component::ParentDir | std::path::Component::RootDir));
    if escapes || relative.is_empty() {
        return Err(CacheNameError::Escapes(relative));
    }
    Ok(dest_dir.join(relative_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_relative_paths() {
        let workspace = "/home/ci/.flow.ci.agent/flow-1";
        for relative in ["a", "sub/dir/file.jar", "s", "wsx/ws"] {
            let full = format!("{workspace}/{relative}");
            let encoded = encode_cache_name(workspace, &full);
            assert_eq!(decode_cache_name(&encoded).unwrap(), relative);
        }
    }

    #[test]
    fn encoding_is_standard_base64_of_relative_path() {
        assert_eq!(encode_cache_name("/ws", "/ws/node_modules"), "bm9kZV9tb2R1bGVz");
    }

    #[test]
    fn destination_rejects_traversal() {
        let dest = Path::new("/tmp/cache");
        let good = encode_cache_name("/ws", "/ws/target/app.jar");
        assert_eq!(cache_destination(dest, &good).unwrap(), dest.join("target/app.jar"));

        let bad = STANDARD.encode("../etc/passwd");
        assert!(matches!(cache_destination(dest, &bad), Err(CacheNameError::Escapes(_))));
    }
}
