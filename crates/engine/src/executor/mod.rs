//! Step execution: lifecycle skeleton plus the shell, Docker and Kubernetes backends.
//!
//! - [`StepExecutor`] owns the step context, the retry loop, status mapping,
//!   environment export and interactive session coordination
//! - [`Backend`] is the seam each isolation mode implements
//! - [`StepRuntime`] is the state both sides share

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use flowci_types::{LogKind, StepResult, StepStatus, VariableStore, exit_code};
use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecutorError;

mod backend;
pub mod docker;
pub mod k8s;
#[cfg(unix)]
mod pty;
mod runtime;
mod script;
pub mod shell;
mod tty;

pub use backend::{Backend, BackendKind};
pub use runtime::{
    CancelCause, StepRuntime, VAR_AGENT_ID, VAR_AGENT_WORKSPACE, VAR_FLOW_ID, VAR_JOB_DIR, VAR_JOB_ID, VAR_PLUGIN_DIR, VAR_STEP_ID,
};
pub use tty::{TtyOutput, TtySession};

use tty::TTY_INPUT_CAPACITY;

/// Exit code reported by bash for an unknown command.
const UNKNOWN_COMMAND: i32 = exit_code::UNKNOWN_COMMAND;

/// Outcome of one attempt.
#[derive(Debug)]
enum Attempt {
    Exited(i32),
    Failed(ExecutorError),
    Panicked(String),
}

impl Attempt {
    fn may_retry(&self, allow_failure: bool) -> bool {
        match self {
            Self::Exited(code) => *code != exit_code::SUCCESS && (!allow_failure || *code == UNKNOWN_COMMAND),
            Self::Failed(error) => error.is_retryable(),
            Self::Panicked(_) => false,
        }
    }
}

/// Terminal status, code and error for an attempt outcome.
fn settle(attempt: &Attempt, cause: Option<CancelCause>, allow_failure: bool) -> (StepStatus, i32, Option<String>) {
    match cause {
        Some(CancelCause::Timeout) => return (StepStatus::Timeout, exit_code::TIMEOUT, None),
        Some(CancelCause::Killed) => return (StepStatus::Killed, exit_code::KILLED, None),
        None => {}
    }
    match attempt {
        Attempt::Exited(exit_code::SUCCESS) => (StepStatus::Success, exit_code::SUCCESS, None),
        Attempt::Exited(UNKNOWN_COMMAND) => (
            StepStatus::Exception,
            UNKNOWN_COMMAND,
            Some("command not found (exit code 127)".to_string()),
        ),
        Attempt::Exited(code) if allow_failure => (StepStatus::Success, *code, None),
        Attempt::Exited(code) => (StepStatus::Exception, *code, Some(format!("exit code {code}"))),
        Attempt::Failed(ExecutorError::Step { code }) => settle(&Attempt::Exited(*code), None, allow_failure),
        Attempt::Failed(error) => (StepStatus::Exception, exit_code::UNKNOWN, Some(error.to_string())),
        Attempt::Panicked(message) => (StepStatus::Exception, exit_code::UNKNOWN, Some(message.clone())),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panic: {detail}")
}

struct TtyHandle {
    id: String,
    token: CancellationToken,
    input: mpsc::Sender<String>,
}

/// Runs one step through its backend, from `init` to a terminal [`StepResult`].
pub struct StepExecutor {
    runtime: Arc<StepRuntime>,
    backend: Arc<dyn Backend>,
    started: AtomicBool,
    tty: Mutex<Option<TtyHandle>>,
}

impl StepExecutor {
    pub fn new(runtime: StepRuntime, backend: Arc<dyn Backend>) -> Self {
        Self {
            runtime: Arc::new(runtime),
            backend,
            started: AtomicBool::new(false),
            tty: Mutex::new(None),
        }
    }

    pub fn runtime(&self) -> &Arc<StepRuntime> {
        &self.runtime
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn step_id(&self) -> &str {
        &self.runtime.step().id
    }

    /// Host directory the step cache is restored into and saved from.
    pub fn cache_dir(&self) -> PathBuf {
        self.backend.cache_dir(&self.runtime)
    }

    /// Snapshot of the current result.
    pub fn result(&self) -> StepResult {
        self.runtime.result()
    }

    /// Validates the step, resolves its variables and prepares the backend.
    ///
    /// A failure marks the result EXCEPTION; `start` then returns it unchanged.
    #[instrument(skip_all, fields(step_id = %self.step_id(), backend = self.backend.kind().name()))]
    pub async fn init(&self) -> Result<(), ExecutorError> {
        let outcome = AssertUnwindSafe(self.prepare()).catch_unwind().await;
        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(error)) => error,
            Err(payload) => ExecutorError::backend(panic_message(payload)),
        };
        warn!(error = %error, "step init failed");
        let message = error.to_string();
        if let Err(error) = self.runtime.log().write_text(LogKind::Err, &message).await {
            warn!(error = %error, "failed to log init failure");
        }
        self.runtime.update_result(|result| result.fail(message, Utc::now()));
        Err(error)
    }

    async fn prepare(&self) -> Result<(), ExecutorError> {
        let runtime = &self.runtime;
        runtime.step().validate()?;

        let step = runtime.step();
        let context = runtime.context();
        let (workspace, job_dir, plugin_dir) = self.backend.script_paths(runtime);
        let mut variables = VariableStore::new();
        variables.set(VAR_AGENT_ID, context.agent_id.as_str())?;
        variables.set(VAR_AGENT_WORKSPACE, workspace)?;
        variables.set(VAR_JOB_DIR, job_dir)?;
        variables.set(VAR_PLUGIN_DIR, plugin_dir)?;
        variables.set(VAR_FLOW_ID, step.flow_id.as_str())?;
        variables.set(VAR_JOB_ID, step.job_id.as_str())?;
        variables.set(VAR_STEP_ID, step.id.as_str())?;
        variables.merge(&step.inputs);
        variables.resolve(Some(&VariableStore::from_process_env()));
        runtime.set_variables(variables);

        self.backend.init(runtime).await
    }

    /// Runs the step to a terminal status and returns the final result.
    ///
    /// Only the first call runs the step; later calls return the current result.
    #[instrument(skip_all, fields(step_id = %self.step_id(), backend = self.backend.kind().name()))]
    pub async fn start(&self) -> StepResult {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("step already started");
            return self.runtime.result();
        }

        let runtime = &self.runtime;
        if !runtime.result().is_terminal() {
            runtime.update_result(|result| result.mark_running(Utc::now()));
            info!(timeout_seconds = runtime.step().timeout_seconds, retry = runtime.step().retry, "step running");

            let finished = CancellationToken::new();
            let watcher = self.spawn_deadline_watcher(finished.clone());
            let attempt = self.run_attempts().await;
            finished.cancel();
            let _ = watcher.await;

            self.settle_attempt(attempt).await;
            self.cleanup().await;
        }

        if !self.backend.supports_detached_tty() {
            self.stop_tty().await;
        }
        match runtime.log().close().await {
            Ok(summary) => runtime.update_result(|result| result.log_size = summary.log_size),
            Err(error) => warn!(error = %error, "failed to close step log"),
        }

        let result = runtime.result();
        info!(status = %result.status, code = result.code, log_size = result.log_size, "step finished");
        result
    }

    fn spawn_deadline_watcher(&self, finished: CancellationToken) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(&self.runtime);
        let timeout = Duration::from_secs(runtime.step().timeout_seconds);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    debug!(step_id = %runtime.step().id, "step deadline exceeded");
                    runtime.cancel_with(CancelCause::Timeout);
                }
                _ = finished.cancelled() => {}
                _ = runtime.cancel_token().cancelled() => {}
            }
        })
    }

    async fn run_attempts(&self) -> Attempt {
        let runtime = &self.runtime;
        let step = runtime.step();
        let max_attempts = step.retry.saturating_add(1);
        let mut attempt_number = 1;
        loop {
            runtime.begin_attempt().await;
            let attempt = match AssertUnwindSafe(self.backend.run(runtime)).catch_unwind().await {
                Ok(Ok(code)) => Attempt::Exited(code),
                Ok(Err(error)) => Attempt::Failed(error),
                Err(payload) => Attempt::Panicked(panic_message(payload)),
            };
            debug!(attempt = attempt_number, outcome = ?attempt, "attempt finished");

            if runtime.is_cancelled() || attempt_number >= max_attempts || !attempt.may_retry(step.allow_failure) {
                return attempt;
            }

            attempt_number += 1;
            let marker = format!("[flow.ci] step failed, retrying ({attempt_number}/{max_attempts})");
            if let Err(error) = runtime.log().write_line(LogKind::Out, marker.as_bytes()).await {
                warn!(error = %error, "failed to write retry marker");
            }
            runtime.update_result(StepResult::reset_for_retry);
        }
    }

    async fn settle_attempt(&self, attempt: Attempt) {
        let runtime = &self.runtime;
        let cause = runtime.cause();
        if cause.is_some() {
            self.backend.abort(runtime).await;
        }
        let (status, code, error) = settle(&attempt, cause, runtime.step().allow_failure);

        if status == StepStatus::Success && code == exit_code::SUCCESS {
            match self.backend.collect_env(runtime).await {
                Ok(exported) => {
                    let output = exported.filter_by_prefix(&runtime.step().env_filters);
                    runtime.update_result(|result| result.output = output);
                }
                Err(error) => warn!(error = %error, "failed to collect exported environment"),
            }
        }

        if status == StepStatus::Success && runtime.step().cache.is_some() {
            if let Err(error) = self.backend.export_cache(runtime).await {
                warn!(error = %error, "failed to export cache paths");
            }
        }

        if let Some(message) = error.as_deref()
            && matches!(attempt, Attempt::Failed(_) | Attempt::Panicked(_))
            && let Err(error) = runtime.log().write_text(LogKind::Err, message).await
        {
            warn!(error = %error, "failed to log step error");
        }
        runtime.update_result(|result| {
            result.error = error;
            result.finish(status, code, Utc::now());
        });
    }

    async fn cleanup(&self) {
        if let Err(payload) = AssertUnwindSafe(self.backend.cleanup(&self.runtime)).catch_unwind().await {
            warn!(error = %panic_message(payload), "backend cleanup panicked");
        }
    }

    /// Cancels the step context with cause KILLED.
    pub fn kill(&self) {
        info!(step_id = %self.step_id(), "killing step");
        self.runtime.cancel_with(CancelCause::Killed);
    }

    /// Opens an interactive session and returns when it ends.
    ///
    /// `on_started` runs once the backend attached. Terminal output is sent
    /// base64 encoded to `output`.
    #[instrument(skip_all, fields(step_id = %self.step_id(), tty_id = %tty_id))]
    pub async fn start_tty(
        &self,
        tty_id: &str,
        output: mpsc::Sender<String>,
        on_started: impl FnOnce(&str) + Send + 'static,
    ) -> Result<(), ExecutorError> {
        let status = self.runtime.result().status;
        let detached = status.is_terminal() && self.backend.supports_detached_tty();
        if status != StepStatus::Running && !detached {
            return Err(ExecutorError::NotRunning);
        }

        let token = if self.runtime.is_cancelled() || detached {
            CancellationToken::new()
        } else {
            self.runtime.cancel_token().child_token()
        };
        let (input_tx, input_rx) = mpsc::channel(TTY_INPUT_CAPACITY);
        {
            let mut slot = self.tty.lock().await;
            if slot.is_some() {
                return Err(ExecutorError::AlreadyInteracting);
            }
            *slot = Some(TtyHandle {
                id: tty_id.to_string(),
                token: token.clone(),
                input: input_tx,
            });
        }

        let session = TtySession::new(tty_id, input_rx, output, token.clone(), Box::new(on_started));
        let outcome = match AssertUnwindSafe(self.backend.open_tty(&self.runtime, session)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(ExecutorError::backend(panic_message(payload))),
        };
        token.cancel();

        let mut slot = self.tty.lock().await;
        if slot.as_ref().is_some_and(|handle| handle.id == tty_id) {
            *slot = None;
        }
        debug!(ok = outcome.is_ok(), "interactive session ended");
        outcome
    }

    /// Pushes one input line to the open session.
    pub async fn tty_input(&self, line: String) -> Result<(), ExecutorError> {
        let sender = {
            let slot = self.tty.lock().await;
            slot.as_ref().map(|handle| handle.input.clone()).ok_or(ExecutorError::NotRunning)?
        };
        sender.send(line).await.map_err(|_| ExecutorError::NotRunning)
    }

    /// Id of the open session, if any.
    pub async fn tty_id(&self) -> Option<String> {
        self.tty.lock().await.as_ref().map(|handle| handle.id.clone())
    }

    /// Closes the interactive side; never affects the step status.
    pub async fn stop_tty(&self) {
        let token = self.tty.lock().await.as_ref().map(|handle| handle.token.clone());
        if let Some(token) = token {
            token.cancel();
            self.backend.stop_tty(&self.runtime).await;
        }
    }
}
