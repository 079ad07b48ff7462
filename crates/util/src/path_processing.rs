use std::path::{Path, PathBuf};

use dirs_next::home_dir;

/// Directory name used under the home directory when no workspace is configured.
pub const DEFAULT_WORKSPACE_DIR: &str = ".flow.ci.agent";

/// Expands a leading `~` (either separator style) to the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    let p = path.trim();
    let home = || home_dir().unwrap_or_else(|| PathBuf::from("~"));
    if p == "~" {
        return home();
    }
    match p.strip_prefix("~/").or_else(|| p.strip_prefix("~\\")) {
        Some(rest) => home().join(rest),
        None => PathBuf::from(p),
    }
}

/// `~/.flow.ci.agent`, or a relative `.flow.ci.agent` when the home directory is unknown.
pub fn default_workspace() -> PathBuf {
    home_dir().map(|home| home.join(DEFAULT_WORKSPACE_DIR)).unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR))
}

/// Renders a path with forward slashes, as used inside containers and pods.
pub fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
