//! Helpers shared by the flow.ci agent crates.

pub mod ansi;
pub mod cache_name;
pub mod env_file;
pub mod path_processing;
pub mod redact;

pub use ansi::strip_ansi;
pub use cache_name::{CacheNameError, cache_destination, decode_cache_name, encode_cache_name};
pub use env_file::{parse_unix_env, parse_windows_env};
pub use path_processing::{DEFAULT_WORKSPACE_DIR, default_workspace, expand_tilde, to_slash};
pub use redact::redact_sensitive;
