//! [`ControllerClient`] over the REST client and the websocket session.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flowci_engine::controller::DownloadProgress;
use flowci_engine::{ControllerClient, ControllerError};
use flowci_types::{
    AgentInit, ControllerFrame, JobCache, Resource, Settings, ShellLogBody, ShellLogHeaders, StepResult, TtyLogHeaders, TtyOut,
};

use crate::http::HttpControllerClient;
use crate::session::ControllerSession;

/// Controller client used by the agent.
///
/// Frames can only be published once a session was attached; until then
/// publishing fails with [`ControllerError::Closed`].
pub struct AgentClient {
    http: HttpControllerClient,
    session: OnceLock<ControllerSession>,
}

impl AgentClient {
    pub fn new(http: HttpControllerClient) -> Self {
        Self {
            http,
            session: OnceLock::new(),
        }
    }

    pub fn http(&self) -> &HttpControllerClient {
        &self.http
    }

    /// Attaches the websocket session; a second session is handed back.
    pub fn attach(&self, session: ControllerSession) -> Result<(), ControllerSession> {
        self.session.set(session)
    }

    /// Closes the attached session, if any.
    pub async fn close(&self) {
        if let Some(session) = self.session.get() {
            session.close().await;
        }
    }

    async fn publish(&self, frame: ControllerFrame) -> Result<(), ControllerError> {
        self.session.get().ok_or(ControllerError::Closed)?.publish(&frame).await
    }
}

#[async_trait::async_trait]
impl ControllerClient for AgentClient {
    async fn connect(&self, init: &AgentInit) -> Result<Settings, ControllerError> {
        self.http.connect(init).await
    }

    async fn report_profile(&self, resource: &Resource) -> Result<(), ControllerError> {
        self.http.report_profile(resource).await
    }

    async fn upload_log(&self, step_id: &str, path: &Path) -> Result<(), ControllerError> {
        self.http.upload_log(step_id, path).await
    }

    async fn cache_get(&self, job_id: &str, key: &str) -> Result<Option<JobCache>, ControllerError> {
        self.http.cache_get(job_id, key).await
    }

    async fn cache_put(&self, job_id: &str, key: &str, workspace: &Path, files: &[PathBuf]) -> Result<(), ControllerError> {
        self.http.cache_put(job_id, key, workspace, files).await
    }

    async fn cache_download(
        &self,
        cache_id: &str,
        dest_dir: &Path,
        encoded_name: &str,
        progress: DownloadProgress<'_>,
    ) -> Result<PathBuf, ControllerError> {
        self.http.cache_download(cache_id, dest_dir, encoded_name, progress).await
    }

    async fn send_shell_log(&self, job_id: &str, step_id: &str, content: String) -> Result<(), ControllerError> {
        self.publish(shell_log_frame(job_id, step_id, content)).await
    }

    async fn send_tty_log(&self, tty_id: &str, content: String) -> Result<(), ControllerError> {
        self.publish(ControllerFrame::TtyLog {
            headers: TtyLogHeaders { id: tty_id.to_string() },
            body: content,
        })
        .await
    }

    async fn send_tty_result(&self, out: &TtyOut) -> Result<(), ControllerError> {
        self.publish(ControllerFrame::TtyResult { body: out.clone() }).await
    }

    async fn send_result(&self, result: &StepResult) -> Result<(), ControllerError> {
        self.publish(ControllerFrame::StepResult { body: result.clone() }).await
    }
}

fn shell_log_frame(job_id: &str, step_id: &str, content: String) -> ControllerFrame {
    ControllerFrame::ShellLog {
        headers: ShellLogHeaders {
            id: job_id.to_string(),
            step_id: step_id.to_string(),
        },
        body: ShellLogBody {
            id: step_id.to_string(),
            content,
        },
    }
}
