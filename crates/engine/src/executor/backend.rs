//! Seam between the step lifecycle and an isolation backend.

use std::path::PathBuf;

use async_trait::async_trait;
use flowci_types::VariableStore;

use crate::error::ExecutorError;
use crate::executor::{StepRuntime, TtySession};

/// Isolation backend a step runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Shell,
    Docker,
    K8s,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Docker => "docker",
            Self::K8s => "k8s",
        }
    }
}

/// Backend-specific half of a step executor.
///
/// Every method receives the shared [`StepRuntime`]; backends keep their own
/// resources (child processes, container ids, pods) behind interior mutability.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Paths as seen by scripts: `(workspace, job dir, plugin dir)`.
    fn script_paths(&self, runtime: &StepRuntime) -> (String, String, String);

    /// Prepares directories, volumes, networks and configs. Runs once before the first attempt.
    async fn init(&self, runtime: &StepRuntime) -> Result<(), ExecutorError>;

    /// Runs one attempt of the step scripts and returns the exit code.
    ///
    /// Must return promptly with [`ExecutorError::Cancelled`] once the step
    /// context is cancelled.
    async fn run(&self, runtime: &StepRuntime) -> Result<i32, ExecutorError>;

    /// Reads the environment exported by the last successful attempt.
    async fn collect_env(&self, runtime: &StepRuntime) -> Result<VariableStore, ExecutorError>;

    /// Host directory the step cache is restored into and saved from.
    fn cache_dir(&self, runtime: &StepRuntime) -> PathBuf {
        runtime.context().cache_staging_dir(&runtime.step().id)
    }

    /// Copies the cache paths of a successful step from the work dir into [`Backend::cache_dir`].
    ///
    /// Runs before cleanup. Backends working directly in the cache dir keep the default.
    async fn export_cache(&self, _runtime: &StepRuntime) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// Terminates whatever the attempt left running after a timeout or kill.
    async fn abort(&self, _runtime: &StepRuntime) {}

    /// Runs an interactive session until either side closes it.
    async fn open_tty(&self, runtime: &StepRuntime, session: TtySession) -> Result<(), ExecutorError>;

    /// Best-effort termination of the interactive side.
    async fn stop_tty(&self, _runtime: &StepRuntime) {}

    /// Releases resources after a terminal outcome. Failures are logged, never raised.
    async fn cleanup(&self, runtime: &StepRuntime);

    /// Whether a session may be opened after the step reached a terminal status.
    fn supports_detached_tty(&self) -> bool {
        false
    }
}
