//! Single-slot dispatcher.
//!
//! Accepts at most one step at a time, prepares it (plugin and cache), runs it
//! on a spawned task and routes KILL, TTY and CLOSE commands to it. When the
//! step is terminal the dispatcher uploads its log, saves its cache and
//! publishes the result.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use flowci_types::{AgentCommand, LogItem, StepIn, StepResult, StepStatus, TtyAction, TtyIn, TtyOut};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache;
use crate::context::AgentContext;
use crate::controller::{ControllerClient, PluginFetcher};
use crate::error::{DispatchError, ExecutorError};
use crate::executor::{BackendKind, StepExecutor};
use crate::factory;

const TTY_OUTPUT_CAPACITY: usize = 1000;
/// How long forwarders may drain after their producer finished.
const FORWARDER_GRACE: Duration = Duration::from_secs(10);

#[derive(Default)]
enum Slot {
    #[default]
    Idle,
    Preparing(String),
    Running(Arc<StepExecutor>),
}

impl Slot {
    fn step_id(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::Preparing(step_id) => Some(step_id),
            Self::Running(executor) => Some(executor.step_id()),
        }
    }
}

struct Shared {
    context: Arc<AgentContext>,
    controller: Arc<dyn ControllerClient>,
    plugins: Arc<dyn PluginFetcher>,
    slot: Mutex<Slot>,
    /// Most recent finished executor, kept for detached interactive sessions.
    last: Mutex<Option<Arc<StepExecutor>>>,
}

impl Shared {
    async fn publish_tty(&self, out: TtyOut) {
        if let Err(error) = self.controller.send_tty_result(&out).await {
            warn!(tty_id = %out.id, error = %error, "failed to publish tty result");
        }
    }

    async fn finish_step(&self, executor: Arc<StepExecutor>, forwarder: JoinHandle<()>) {
        let result = executor.start().await;
        if tokio::time::timeout(FORWARDER_GRACE, forwarder).await.is_err() {
            warn!(step_id = %result.id, "log forwarder did not drain in time");
        }

        let log_path = executor.runtime().log().path().to_path_buf();
        if let Err(error) = self.controller.upload_log(&result.id, &log_path).await {
            warn!(step_id = %result.id, error = %error, "failed to upload step log");
        }
        let step = executor.runtime().step();
        let cache_dir = executor.cache_dir();
        if result.status == StepStatus::Success
            && let Err(error) = cache::save(self.controller.as_ref(), step, &cache_dir).await
        {
            warn!(step_id = %result.id, error = %error, "failed to save cache");
        }
        if executor.backend_kind() != BackendKind::Shell
            && let Err(error) = cache::discard(&cache_dir).await
        {
            debug!(step_id = %result.id, error = %error, "cache staging dir not removed");
        }

        *self.last.lock().await = Some(executor.clone());
        *self.slot.lock().await = Slot::Idle;
        if let Err(error) = self.controller.send_result(&result).await {
            warn!(step_id = %result.id, error = %error, "failed to publish step result");
        }
        info!(step_id = %result.id, status = %result.status, "step reported");
    }
}

/// Routes controller commands to the single running step.
pub struct Dispatcher {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(context: Arc<AgentContext>, controller: Arc<dyn ControllerClient>, plugins: Arc<dyn PluginFetcher>) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                controller,
                plugins,
                slot: Mutex::new(Slot::Idle),
                last: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Id of the step currently occupying the slot.
    pub async fn current_step(&self) -> Option<String> {
        self.shared.slot.lock().await.step_id().map(str::to_string)
    }

    /// Handles one controller command; `Break` once the agent should exit.
    pub async fn handle(&self, command: AgentCommand) -> ControlFlow<()> {
        let outcome = match command {
            AgentCommand::Shell(step) => self.execute(step).await,
            AgentCommand::Kill => self.kill().await,
            AgentCommand::Tty(request) => self.tty(request).await,
            AgentCommand::Close => {
                self.shutdown().await;
                return ControlFlow::Break(());
            }
        };
        if let Err(error) = outcome {
            warn!(error = %error, "command rejected");
        }
        ControlFlow::Continue(())
    }

    /// Accepts `step` unless another one occupies the slot.
    ///
    /// Returns once the step was initialised; it keeps running on a spawned task.
    #[instrument(skip_all, fields(step_id = %step.id))]
    pub async fn execute(&self, step: StepIn) -> Result<(), DispatchError> {
        {
            let mut slot = self.shared.slot.lock().await;
            if let Some(step_id) = slot.step_id() {
                return Err(DispatchError::busy(step_id));
            }
            *slot = Slot::Preparing(step.id.clone());
        }
        info!(job_id = %step.job_id, "step accepted");

        let (executor, forwarder) = match self.prepare(step.clone()).await {
            Ok(prepared) => prepared,
            Err(error) => {
                warn!(error = %error, "step preparation failed");
                *self.shared.slot.lock().await = Slot::Idle;
                let mut result = StepResult::new(step.id.clone());
                result.fail(error.to_string(), Utc::now());
                if let Err(error) = self.shared.controller.send_result(&result).await {
                    warn!(error = %error, "failed to publish step result");
                }
                return Err(error.into());
            }
        };

        *self.shared.slot.lock().await = Slot::Running(executor.clone());
        if let Err(error) = executor.init().await {
            debug!(error = %error, "init failed; the result carries the error");
        }
        let shared = self.shared.clone();
        let task = tokio::spawn(async move { shared.finish_step(executor, forwarder).await });
        *self.task.lock().await = Some(task);
        Ok(())
    }

    async fn prepare(&self, step: StepIn) -> Result<(Arc<StepExecutor>, JoinHandle<()>), ExecutorError> {
        let shared = &self.shared;
        if let Some(plugin) = step.plugin.as_deref() {
            let dest = shared.context.plugin_path(plugin);
            shared
                .plugins
                .fetch(plugin, &dest)
                .await
                .map_err(|error| ExecutorError::backend(format!("failed to fetch plugin {plugin}: {error:#}")))?;
            debug!(plugin, dest = %dest.display(), "plugin ready");
        }

        let (sink, items) = mpsc::channel(shared.context.log_queue_capacity);
        let forwarder = spawn_log_forwarder(shared.controller.clone(), step.job_id.clone(), items);
        let executor = factory::create_executor(step, shared.context.clone(), Some(sink)).await?;

        let cache_dir = executor.cache_dir();
        if let Err(error) = cache::restore(shared.controller.as_ref(), executor.runtime().step(), &cache_dir).await {
            warn!(error = %error, "cache restore failed; continuing without cache");
        }
        Ok((Arc::new(executor), forwarder))
    }

    /// Kills the running step.
    pub async fn kill(&self) -> Result<(), DispatchError> {
        match &*self.shared.slot.lock().await {
            Slot::Running(executor) => {
                executor.kill();
                Ok(())
            }
            Slot::Preparing(step_id) => {
                warn!(step_id = %step_id, "kill ignored while the step is being prepared");
                Ok(())
            }
            Slot::Idle => Err(DispatchError::Idle),
        }
    }

    pub async fn tty(&self, request: TtyIn) -> Result<(), DispatchError> {
        match request.action {
            TtyAction::Open => self.open_tty(request.id).await,
            TtyAction::Close => {
                let Some(executor) = self.tty_target().await else {
                    self.shared.publish_tty(TtyOut::failed(&request.id, TtyAction::Close, "no step to attach to")).await;
                    return Err(DispatchError::Idle);
                };
                if executor.tty_id().await.is_none() {
                    self.shared.publish_tty(TtyOut::failed(&request.id, TtyAction::Close, "no open tty")).await;
                    return Ok(());
                }
                executor.stop_tty().await;
                Ok(())
            }
            TtyAction::Shell => {
                let executor = self.tty_target().await.ok_or(DispatchError::Idle)?;
                executor.tty_input(request.input.unwrap_or_default()).await?;
                Ok(())
            }
        }
    }

    async fn tty_target(&self) -> Option<Arc<StepExecutor>> {
        if let Slot::Running(executor) = &*self.shared.slot.lock().await {
            return Some(executor.clone());
        }
        self.shared.last.lock().await.clone()
    }

    /// Starts an interactive session in the background; acks are published as it opens and closes.
    async fn open_tty(&self, tty_id: String) -> Result<(), DispatchError> {
        let Some(executor) = self.tty_target().await else {
            self.shared.publish_tty(TtyOut::failed(&tty_id, TtyAction::Open, "no step to attach to")).await;
            return Err(DispatchError::Idle);
        };

        let shared = self.shared.clone();
        let (output_tx, output_rx) = mpsc::channel(TTY_OUTPUT_CAPACITY);
        let forwarder = spawn_tty_forwarder(shared.controller.clone(), tty_id.clone(), output_rx);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let ack = tokio::spawn({
            let shared = shared.clone();
            let tty_id = tty_id.clone();
            async move {
                if started_rx.await.is_err() {
                    return false;
                }
                shared.publish_tty(TtyOut::ok(&tty_id, TtyAction::Open)).await;
                true
            }
        });

        tokio::spawn(async move {
            let outcome = executor
                .start_tty(&tty_id, output_tx, move |_| {
                    let _ = started_tx.send(());
                })
                .await;
            let started = ack.await.unwrap_or(false);
            if tokio::time::timeout(FORWARDER_GRACE, forwarder).await.is_err() {
                warn!(tty_id = %tty_id, "tty forwarder did not drain in time");
            }
            let out = match outcome {
                Ok(()) => TtyOut::ok(&tty_id, TtyAction::Close),
                Err(error) if !started => TtyOut::failed(&tty_id, TtyAction::Open, error.to_string()),
                Err(error) => TtyOut::failed(&tty_id, TtyAction::Close, error.to_string()),
            };
            shared.publish_tty(out).await;
        });
        Ok(())
    }

    /// Kills the running step and waits up to the shutdown timeout for it to be reported.
    pub async fn shutdown(&self) {
        if let Slot::Running(executor) = &*self.shared.slot.lock().await {
            info!(step_id = %executor.step_id(), "shutting down; killing running step");
            executor.kill();
        }
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && tokio::time::timeout(self.shared.context.shutdown_timeout, task).await.is_err()
        {
            warn!("running step did not finish before the shutdown timeout");
        }
    }

    /// Waits until the last accepted step has been reported.
    pub async fn wait(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

fn spawn_log_forwarder(controller: Arc<dyn ControllerClient>, job_id: String, mut items: mpsc::Receiver<LogItem>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = items.recv().await {
            let content = STANDARD.encode(&item.content);
            if let Err(error) = controller.send_shell_log(&job_id, &item.step_id, content).await {
                debug!(step_id = %item.step_id, line = item.line_number, error = %error, "failed to forward log line");
            }
        }
    })
}

fn spawn_tty_forwarder(controller: Arc<dyn ControllerClient>, tty_id: String, mut output: mpsc::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = output.recv().await {
            if let Err(error) = controller.send_tty_log(&tty_id, chunk).await {
                debug!(tty_id = %tty_id, error = %error, "failed to forward tty output");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex as StdMutex;

    use flowci_types::{AgentInit, CacheSpec, JobCache, Resource, Settings};

    use crate::controller::DownloadProgress;
    use crate::error::ControllerError;

    #[derive(Default)]
    struct RecordingController {
        logs: StdMutex<Vec<(String, String, String)>>,
        uploads: StdMutex<Vec<PathBuf>>,
        results: StdMutex<Vec<StepResult>>,
        cached: StdMutex<Vec<(String, Vec<PathBuf>)>>,
        stored: Option<JobCache>,
    }

    #[async_trait::async_trait]
    impl ControllerClient for RecordingController {
        async fn connect(&self, _init: &AgentInit) -> Result<Settings, ControllerError> {
            Ok(Settings::default())
        }

        async fn report_profile(&self, _resource: &Resource) -> Result<(), ControllerError> {
            Ok(())
        }

        async fn upload_log(&self, _step_id: &str, path: &Path) -> Result<(), ControllerError> {
            self.uploads.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn cache_get(&self, _job_id: &str, _key: &str) -> Result<Option<JobCache>, ControllerError> {
            Ok(self.stored.clone())
        }

        async fn cache_put(&self, _job_id: &str, key: &str, _workspace: &Path, files: &[PathBuf]) -> Result<(), ControllerError> {
            self.cached.lock().unwrap().push((key.to_string(), files.to_vec()));
            Ok(())
        }

        async fn cache_download(
            &self,
            _cache_id: &str,
            dest_dir: &Path,
            encoded_name: &str,
            progress: DownloadProgress<'_>,
        ) -> Result<PathBuf, ControllerError> {
            let dest = dest_dir.join(encoded_name);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dest, b"cached")?;
            progress(6);
            Ok(dest)
        }

        async fn send_shell_log(&self, job_id: &str, step_id: &str, content: String) -> Result<(), ControllerError> {
            self.logs.lock().unwrap().push((job_id.to_string(), step_id.to_string(), content));
            Ok(())
        }

        async fn send_tty_log(&self, _tty_id: &str, _content: String) -> Result<(), ControllerError> {
            Ok(())
        }

        async fn send_tty_result(&self, _out: &TtyOut) -> Result<(), ControllerError> {
            Ok(())
        }

        async fn send_result(&self, result: &StepResult) -> Result<(), ControllerError> {
            self.results.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    struct FailingPlugins;

    #[async_trait::async_trait]
    impl PluginFetcher for FailingPlugins {
        async fn fetch(&self, name: &str, _dest: &Path) -> anyhow::Result<()> {
            anyhow::bail!("repository for {name} not found")
        }
    }

    fn dispatcher(dir: &Path) -> (Arc<RecordingController>, Dispatcher) {
        dispatcher_with(dir, RecordingController::default())
    }

    fn dispatcher_with(dir: &Path, controller: RecordingController) -> (Arc<RecordingController>, Dispatcher) {
        let context = Arc::new(AgentContext::new("a1", dir));
        context.ensure_dirs().unwrap();
        let controller = Arc::new(controller);
        let dispatcher = Dispatcher::new(context, controller.clone(), Arc::new(FailingPlugins));
        (controller, dispatcher)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_step_and_reports_it() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, dispatcher) = dispatcher(dir.path());
        let mut step = StepIn::new("s1", vec!["echo hi".into(), "mkdir -p out && echo x > out/a".into()]);
        step.cache = Some(CacheSpec {
            key: "deps".into(),
            paths: vec!["out".into()],
        });

        dispatcher.execute(step).await.unwrap();
        dispatcher.wait().await;

        let results = controller.results.lock().unwrap().clone();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, StepStatus::Success);
        let logs = controller.logs.lock().unwrap().clone();
        assert!(logs.contains(&("job".to_string(), "s1".to_string(), "aGk=".to_string())), "{logs:?}");
        assert_eq!(controller.uploads.lock().unwrap()[0], dir.path().join("logs").join("s1.log"));
        let cached = controller.cached.lock().unwrap().clone();
        assert_eq!(cached, vec![("deps".to_string(), vec![dir.path().join("flow").join("out").join("a")])]);
        assert_eq!(dispatcher.current_step().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restored_cache_is_visible_to_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let controller = RecordingController {
            stored: Some(JobCache {
                id: "c1".into(),
                key: "deps".into(),
                files: vec!["deps/a.jar".into()],
            }),
            ..RecordingController::default()
        };
        let (controller, dispatcher) = dispatcher_with(dir.path(), controller);
        let mut step = StepIn::new("s1", vec!["test \"$(cat deps/a.jar)\" = cached".into()]);
        step.cache = Some(CacheSpec {
            key: "deps".into(),
            paths: vec!["deps".into()],
        });

        dispatcher.execute(step).await.unwrap();
        dispatcher.wait().await;

        assert_eq!(controller.results.lock().unwrap()[0].status, StepStatus::Success);
        let cached = controller.cached.lock().unwrap().clone();
        assert_eq!(cached, vec![("deps".to_string(), vec![dir.path().join("flow").join("deps").join("a.jar")])]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn rejects_second_step_and_kills_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, dispatcher) = dispatcher(dir.path());
        dispatcher.execute(StepIn::new("s1", vec!["sleep 9999".into()])).await.unwrap();

        let error = dispatcher.execute(StepIn::new("s2", vec![])).await.unwrap_err();
        assert!(matches!(error, DispatchError::Busy { step_id } if step_id == "s1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        dispatcher.kill().await.unwrap();
        dispatcher.wait().await;
        assert_eq!(controller.results.lock().unwrap()[0].status, StepStatus::Killed);
        assert!(matches!(dispatcher.kill().await, Err(DispatchError::Idle)));
    }

    #[tokio::test]
    async fn plugin_failure_is_reported_as_exception() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, dispatcher) = dispatcher(dir.path());
        let mut step = StepIn::new("s1", vec![]);
        step.plugin = Some("maven".into());

        assert!(dispatcher.execute(step).await.is_err());
        let results = controller.results.lock().unwrap().clone();
        assert_eq!(results[0].status, StepStatus::Exception);
        assert!(results[0].error.as_deref().unwrap().contains("repository for maven not found"));
        assert_eq!(dispatcher.current_step().await, None);
    }

    #[tokio::test]
    async fn close_breaks_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (_controller, dispatcher) = dispatcher(dir.path());
        assert_eq!(dispatcher.handle(AgentCommand::Kill).await, ControlFlow::Continue(()));
        assert_eq!(dispatcher.handle(AgentCommand::Close).await, ControlFlow::Break(()));
    }
}
