//! State shared between the step executor and its backend.

use std::sync::{Arc, Mutex, OnceLock, RwLock};

use flowci_types::{StepIn, StepResult, VariableStore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::AgentContext;
use crate::logging::LogMultiplexer;

pub const VAR_AGENT_ID: &str = "FLOWCI_AGENT_ID";
pub const VAR_AGENT_WORKSPACE: &str = "FLOWCI_AGENT_WORKSPACE";
pub const VAR_JOB_DIR: &str = "FLOWCI_AGENT_JOB_DIR";
pub const VAR_PLUGIN_DIR: &str = "FLOWCI_AGENT_PLUGIN_DIR";
pub const VAR_FLOW_ID: &str = "FLOWCI_FLOW_ID";
pub const VAR_JOB_ID: &str = "FLOWCI_JOB_ID";
pub const VAR_STEP_ID: &str = "FLOWCI_STEP_ID";

/// Why the step context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Timeout,
    Killed,
}

/// Per-step state visible to backends.
///
/// The cancellation token is the step context: it fires on the deadline or
/// on `kill`, and the first recorded cause wins.
#[derive(Debug)]
pub struct StepRuntime {
    step: StepIn,
    context: Arc<AgentContext>,
    log: Arc<LogMultiplexer>,
    variables: RwLock<VariableStore>,
    result: Mutex<StepResult>,
    cancel: CancellationToken,
    cause: OnceLock<CancelCause>,
    sentinel: Mutex<String>,
}

impl StepRuntime {
    pub fn new(step: StepIn, context: Arc<AgentContext>, log: Arc<LogMultiplexer>) -> Self {
        let result = StepResult::new(step.id.clone());
        Self {
            step,
            context,
            log,
            variables: RwLock::new(VariableStore::new()),
            result: Mutex::new(result),
            cancel: CancellationToken::new(),
            cause: OnceLock::new(),
            sentinel: Mutex::new(new_sentinel()),
        }
    }

    pub fn step(&self) -> &StepIn {
        &self.step
    }

    pub fn context(&self) -> &AgentContext {
        &self.context
    }

    pub fn log(&self) -> &Arc<LogMultiplexer> {
        &self.log
    }

    /// Resolved variables of the step scope.
    pub fn variables(&self) -> VariableStore {
        self.variables.read().expect("variables lock").clone()
    }

    pub(crate) fn set_variables(&self, variables: VariableStore) {
        *self.variables.write().expect("variables lock") = variables;
    }

    /// Expands `${NAME}` references against the step scope.
    pub fn expand(&self, input: &str) -> String {
        self.variables.read().expect("variables lock").resolve_str(input, None)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancels the step context, recording `cause` unless one is already set.
    pub fn cancel_with(&self, cause: CancelCause) {
        let _ = self.cause.set(cause);
        self.cancel.cancel();
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.cause.get().copied()
    }

    /// End-of-script marker of the current attempt.
    pub fn sentinel(&self) -> String {
        self.sentinel.lock().expect("sentinel lock").clone()
    }

    /// Rotates the sentinel and resets the multiplexer's capture state.
    pub(crate) async fn begin_attempt(&self) {
        let sentinel = new_sentinel();
        *self.sentinel.lock().expect("sentinel lock") = sentinel.clone();
        self.log.begin_attempt(Some(&sentinel)).await;
    }

    /// Snapshot of the current result.
    pub fn result(&self) -> StepResult {
        self.result.lock().expect("result lock").clone()
    }

    /// Applies `update` to the result under its lock.
    pub fn update_result<T>(&self, update: impl FnOnce(&mut StepResult) -> T) -> T {
        update(&mut self.result.lock().expect("result lock"))
    }

    pub fn set_process_id(&self, pid: Option<u32>) {
        self.update_result(|result| result.process_id = pid);
    }

    /// Container ids recorded for this step, in declaration order.
    pub fn containers(&self) -> Vec<String> {
        self.update_result(|result| result.containers.clone())
    }

    pub fn set_containers(&self, containers: Vec<String>) {
        self.update_result(|result| result.containers = containers);
    }
}

fn new_sentinel() -> String {
    format!("__FLOWCI_EOF_{}__", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn runtime() -> (tempfile::TempDir, StepRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(AgentContext::new("agent", dir.path()));
        let log = Arc::new(LogMultiplexer::open("s1", &context.logging_dir, false, None).await.unwrap());
        let runtime = StepRuntime::new(StepIn::new("s1", vec![]), context, log);
        (dir, runtime)
    }

    #[tokio::test]
    async fn first_cancel_cause_wins() {
        let (_dir, runtime) = runtime().await;
        assert_eq!(runtime.cause(), None);
        runtime.cancel_with(CancelCause::Timeout);
        runtime.cancel_with(CancelCause::Killed);
        assert!(runtime.is_cancelled());
        assert_eq!(runtime.cause(), Some(CancelCause::Timeout));
    }

    #[tokio::test]
    async fn each_attempt_gets_a_fresh_sentinel() {
        let (_dir, runtime) = runtime().await;
        let first = runtime.sentinel();
        runtime.begin_attempt().await;
        let second = runtime.sentinel();
        assert_ne!(first, second);
        assert!(second.starts_with("__FLOWCI_EOF_"));
    }
}
