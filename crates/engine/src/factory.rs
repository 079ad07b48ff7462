//! Picks the backend for a step and assembles its executor.

use std::sync::Arc;

use flowci_types::{LogItem, StepIn};
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::AgentContext;
use crate::error::ExecutorError;
use crate::executor::docker::DockerBackend;
use crate::executor::k8s::K8sBackend;
use crate::executor::shell::{ShellBackend, ShellKind};
use crate::executor::{Backend, BackendKind, StepExecutor, StepRuntime};
use crate::logging::LogMultiplexer;

/// Backend kind for `step`: containers run on Kubernetes when enabled, on Docker otherwise.
pub fn backend_kind(step: &StepIn, context: &AgentContext) -> BackendKind {
    match (step.has_containers(), context.k8s.enabled) {
        (false, _) => BackendKind::Shell,
        (true, true) => BackendKind::K8s,
        (true, false) => BackendKind::Docker,
    }
}

pub fn create_backend(kind: BackendKind, context: &AgentContext) -> Result<Arc<dyn Backend>, ExecutorError> {
    let backend: Arc<dyn Backend> = match kind {
        BackendKind::Shell => Arc::new(ShellBackend::new(ShellKind::host_default())),
        BackendKind::Docker => Arc::new(DockerBackend::connect(&context.docker_host)?),
        BackendKind::K8s => Arc::new(K8sBackend::new(context.k8s.clone())),
    };
    Ok(backend)
}

/// Opens the step log and wires an executor for `step`.
///
/// Log lines are mirrored to `sink` when given.
pub async fn create_executor(
    step: StepIn,
    context: Arc<AgentContext>,
    sink: Option<mpsc::Sender<LogItem>>,
) -> Result<StepExecutor, ExecutorError> {
    let kind = backend_kind(&step, &context);
    let backend = create_backend(kind, &context)?;
    let log = LogMultiplexer::open(step.id.clone(), &context.logging_dir, context.raw_log, sink).await?;
    debug!(step_id = %step.id, backend = kind.name(), log = %log.path().display(), "executor created");
    let runtime = StepRuntime::new(step, context, Arc::new(log));
    Ok(StepExecutor::new(runtime, backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowci_types::ContainerSpec;

    #[test]
    fn backend_follows_containers_and_k8s_switch() {
        let mut context = AgentContext::new("a1", "/tmp/agent");
        let mut step = StepIn::new("s1", vec![]);
        assert_eq!(backend_kind(&step, &context), BackendKind::Shell);

        step.dockers.push(ContainerSpec::new("ubuntu"));
        assert_eq!(backend_kind(&step, &context), BackendKind::Docker);

        context.k8s.enabled = true;
        assert_eq!(backend_kind(&step, &context), BackendKind::K8s);

        step.dockers.clear();
        assert_eq!(backend_kind(&step, &context), BackendKind::Shell);
    }

    #[tokio::test]
    async fn shell_executor_writes_into_logging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(AgentContext::new("a1", dir.path()));
        context.ensure_dirs().unwrap();
        let executor = create_executor(StepIn::new("s1", vec![]), context.clone(), None).await.unwrap();
        assert_eq!(executor.backend_kind(), BackendKind::Shell);
        assert_eq!(executor.runtime().log().path(), context.logging_dir.join("s1.log"));
    }
}
