//! Capabilities the engine consumes from the outside world.

use std::path::{Path, PathBuf};

use flowci_types::{AgentInit, JobCache, Resource, Settings, StepResult, TtyOut};

use crate::error::ControllerError;

/// Progress callback of a cache download; receives the bytes written so far.
pub type DownloadProgress<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// Everything the agent sends to or fetches from the controller.
#[async_trait::async_trait]
pub trait ControllerClient: Send + Sync {
    /// Registers the agent and returns its settings.
    async fn connect(&self, init: &AgentInit) -> Result<Settings, ControllerError>;

    /// Reports a host resource snapshot.
    async fn report_profile(&self, resource: &Resource) -> Result<(), ControllerError>;

    /// Uploads the persisted log of a finished step.
    async fn upload_log(&self, step_id: &str, path: &Path) -> Result<(), ControllerError>;

    /// Looks up the cache of `key` for a job; `None` when nothing was cached yet.
    async fn cache_get(&self, job_id: &str, key: &str) -> Result<Option<JobCache>, ControllerError>;

    /// Uploads `files` (paths under `workspace`) as the cache `key`.
    async fn cache_put(&self, job_id: &str, key: &str, workspace: &Path, files: &[PathBuf]) -> Result<(), ControllerError>;

    /// Downloads one cached file into `dest_dir` and returns where it landed.
    async fn cache_download(
        &self,
        cache_id: &str,
        dest_dir: &Path,
        encoded_name: &str,
        progress: DownloadProgress<'_>,
    ) -> Result<PathBuf, ControllerError>;

    /// Publishes one base64 encoded step output line.
    async fn send_shell_log(&self, job_id: &str, step_id: &str, content: String) -> Result<(), ControllerError>;

    /// Publishes one base64 encoded chunk of terminal output.
    async fn send_tty_log(&self, tty_id: &str, content: String) -> Result<(), ControllerError>;

    async fn send_tty_result(&self, out: &TtyOut) -> Result<(), ControllerError>;

    async fn send_result(&self, result: &StepResult) -> Result<(), ControllerError>;
}

/// Makes a plugin available on the host before a step uses it.
#[async_trait::async_trait]
pub trait PluginFetcher: Send + Sync {
    /// Clones or updates plugin `name` into `dest`.
    async fn fetch(&self, name: &str, dest: &Path) -> anyhow::Result<()>;
}
