//! Kubernetes backend.
//!
//! The container group becomes one pod with the runtime container first.
//! Everything goes through the `kubectl` binary of the host.

use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flowci_types::{ContainerSpec, LogKind, VariableStore};
use flowci_util::parse_unix_env;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::cache;
use crate::context::{CONTAINER_PLUGIN_DIR, CONTAINER_WORKSPACE, K8sSettings};
use crate::docker::normalize_image;
use crate::error::ExecutorError;
use crate::executor::script::{self, ENV_FILE, SHELL_PID_FILE, TTY_PID_FILE};
use crate::executor::shell::{drain_readers, exit_code, kill_process_tree, spawn_line_reader};
use crate::executor::{Backend, BackendKind, StepRuntime, TtySession};

const RUNTIME_CONTAINER: &str = "runtime";
const WORKSPACE_VOLUME: &str = "ws";
const DEFAULT_ENTRYPOINT: &str = "/bin/bash";
const POD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_NAME_LEN: usize = 63;

#[derive(Debug, Default)]
struct PodState {
    name: String,
    manifest: Value,
    shell: Vec<String>,
    containers: Vec<String>,
    delete: bool,
    created: bool,
}

/// Runs steps in a pod through `kubectl`.
#[derive(Debug)]
pub struct K8sBackend {
    settings: K8sSettings,
    state: Mutex<PodState>,
}

impl K8sBackend {
    pub fn new(settings: K8sSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PodState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PodState> {
        self.state.lock().expect("pod state lock")
    }

    fn current_pod(&self) -> String {
        self.state().name.clone()
    }

    fn kubectl(&self) -> Command {
        let mut command = Command::new(&self.settings.kubectl);
        command.arg("--namespace").arg(&self.settings.namespace).kill_on_drop(true);
        command
    }

    /// `kubectl exec` into the runtime container.
    fn exec(&self, flags: &[&str], cmd: &[String]) -> Command {
        let mut command = self.kubectl();
        command
            .arg("exec")
            .args(flags)
            .arg(self.current_pod())
            .arg("-c")
            .arg(RUNTIME_CONTAINER)
            .arg("--")
            .args(cmd);
        command
    }

    async fn output(&self, mut command: Command, stdin: Option<&[u8]>) -> Result<Vec<u8>, ExecutorError> {
        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|error| ExecutorError::backend(format!("failed to run {}: {error}", self.settings.kubectl)))?;
        if let Some(bytes) = stdin {
            let mut pipe = child.stdin.take().ok_or_else(|| ExecutorError::backend("kubectl stdin unavailable"))?;
            pipe.write_all(bytes).await?;
            drop(pipe);
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::backend(format!("kubectl failed: {}", stderr.trim())));
        }
        Ok(output.stdout)
    }

    async fn ensure_pod(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let (name, manifest, created) = {
            let state = self.state();
            (state.name.clone(), state.manifest.clone(), state.created)
        };
        if created {
            return Ok(());
        }

        info!(pod = %name, namespace = %self.settings.namespace, "creating pod");
        let body = serde_json::to_vec(&manifest).map_err(|error| ExecutorError::backend(error.to_string()))?;
        let mut apply = self.kubectl();
        apply.args(["apply", "-f", "-"]);
        self.output(apply, Some(&body)).await?;

        let containers = {
            let mut state = self.state();
            state.created = true;
            state.containers.clone()
        };
        runtime.set_containers(containers);

        let mut wait = self.kubectl();
        wait.arg("wait")
            .arg("--for=condition=Ready")
            .arg(format!("pod/{name}"))
            .arg(format!("--timeout={}s", POD_READY_TIMEOUT.as_secs()));
        self.output(wait, None).await?;
        self.copy_plugin(runtime).await?;
        self.import_cache(runtime).await
    }

    async fn copy_plugin(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let Some(plugin) = runtime.step().plugin.as_deref() else {
            return Ok(());
        };
        let target = format!("{CONTAINER_PLUGIN_DIR}/{plugin}");
        let prepare = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("rm -rf '{target}' && mkdir -p {CONTAINER_PLUGIN_DIR}"),
        ];
        self.output(self.exec(&[], &prepare), None).await?;

        let source = runtime.context().plugin_path(plugin).display().to_string();
        self.output(self.cp(&source, &format!("{}:{target}", self.current_pod())), None).await?;
        debug!(plugin, "plugin copied");
        Ok(())
    }

    /// `kubectl cp` between the host and the runtime container; pod paths are `<pod>:<path>`.
    fn cp(&self, source: &str, dest: &str) -> Command {
        let mut command = self.kubectl();
        command.arg("cp").arg(source).arg(dest).arg("-c").arg(RUNTIME_CONTAINER);
        command
    }

    /// Copies the restored cache into the pod's work dir.
    async fn import_cache(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let staging = self.cache_dir(runtime);
        if runtime.step().cache.is_none() || !cache::is_populated(&staging).await {
            return Ok(());
        }
        let (_, work_dir, _) = self.script_paths(runtime);
        let command = self.cp(&staging.display().to_string(), &format!("{}:{work_dir}", self.current_pod()));
        self.output(command, None).await?;
        debug!(work_dir = %work_dir, "cache copied into pod");
        Ok(())
    }
}

#[async_trait]
impl Backend for K8sBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::K8s
    }

    fn script_paths(&self, runtime: &StepRuntime) -> (String, String, String) {
        (
            CONTAINER_WORKSPACE.to_string(),
            format!("{CONTAINER_WORKSPACE}/{}", runtime.step().flow_id),
            CONTAINER_PLUGIN_DIR.to_string(),
        )
    }

    #[instrument(skip_all, fields(step_id = %runtime.step().id))]
    async fn init(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let step = runtime.step();
        let runtime_index = step
            .runtime_index()?
            .ok_or_else(|| ExecutorError::config(format!("step {} declares no container", step.id)))?;
        let name = pod_name(&runtime.context().agent_id, &step.id);
        let (manifest, containers) = pod_manifest(runtime, &name, runtime_index)?;
        let runtime_spec = &step.dockers[runtime_index];
        let shell = if runtime_spec.entrypoint.is_empty() {
            vec![DEFAULT_ENTRYPOINT.to_string()]
        } else {
            runtime_spec.entrypoint.clone()
        };

        let mut state = self.state();
        *state = PodState {
            name,
            manifest,
            shell,
            containers,
            delete: runtime_spec.is_delete_container,
            created: false,
        };
        Ok(())
    }

    async fn run(&self, runtime: &StepRuntime) -> Result<i32, ExecutorError> {
        tokio::select! {
            outcome = self.ensure_pod(runtime) => outcome?,
            _ = runtime.cancel_token().cancelled() => return Err(ExecutorError::Cancelled),
        }

        let shell = self.state().shell.clone();
        let mut command = self.exec(&["-i"], &shell);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command
            .spawn()
            .map_err(|error| ExecutorError::backend(format!("failed to run {}: {error}", self.settings.kubectl)))?;
        let pid = child.id();

        let payload = script::container_script(&[], &runtime.context().volumes, &runtime.step().scripts);
        let mut stdin = child.stdin.take().ok_or_else(|| ExecutorError::backend("kubectl stdin unavailable"))?;
        let writer = tokio::spawn(async move {
            if let Err(error) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %error, "kubectl closed stdin before the script was fully written");
            }
        });
        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::backend("kubectl stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutorError::backend("kubectl stderr unavailable"))?;
        let readers = [
            spawn_line_reader(stdout, LogKind::Out, runtime.log().clone()),
            spawn_line_reader(stderr, LogKind::Err, runtime.log().clone()),
        ];

        let status = tokio::select! {
            status = child.wait() => status,
            _ = runtime.cancel_token().cancelled() => {
                kill_process_tree(&mut child, pid).await;
                writer.abort();
                drain_readers(readers).await;
                return Err(ExecutorError::Cancelled);
            }
        };
        let _ = writer.await;
        drain_readers(readers).await;
        Ok(exit_code(status?))
    }

    async fn collect_env(&self, _runtime: &StepRuntime) -> Result<VariableStore, ExecutorError> {
        let output = self.output(self.exec(&[], &["cat".to_string(), ENV_FILE.to_string()]), None).await?;
        Ok(parse_unix_env(&String::from_utf8_lossy(&output)))
    }

    async fn export_cache(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let Some(spec) = runtime.step().cache.as_ref() else {
            return Ok(());
        };
        if !self.state().created {
            return Err(ExecutorError::NotRunning);
        }
        let (_, work_dir, _) = self.script_paths(runtime);
        let staging = self.cache_dir(runtime);
        cache::reset_dir(&staging).await?;
        let pod = self.current_pod();
        for (source, dest) in cache::export_targets(&work_dir, &staging, &spec.paths) {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let command = self.cp(&format!("{pod}:{source}"), &dest.display().to_string());
            if let Err(error) = self.output(command, None).await {
                debug!(path = %source, error = %error, "cache path not copied");
            }
        }
        Ok(())
    }

    async fn abort(&self, _runtime: &StepRuntime) {
        let command = self.exec(&[], &script::kill_command(&[SHELL_PID_FILE, TTY_PID_FILE]));
        if let Err(error) = self.output(command, None).await {
            warn!(error = %error, "failed to kill step shell in pod");
        }
    }

    #[cfg(unix)]
    async fn open_tty(&self, _runtime: &StepRuntime, session: TtySession) -> Result<(), ExecutorError> {
        if !self.state().created {
            return Err(ExecutorError::NotRunning);
        }
        let shell = self.state().shell.clone();
        let command = self.exec(&["-it"], &shell);
        super::pty::run_session(command, session, Some(&script::tty_preamble())).await
    }

    #[cfg(not(unix))]
    async fn open_tty(&self, _runtime: &StepRuntime, _session: TtySession) -> Result<(), ExecutorError> {
        Err(ExecutorError::unsupported("tty"))
    }

    async fn stop_tty(&self, _runtime: &StepRuntime) {
        let command = self.exec(&[], &script::kill_command(&[TTY_PID_FILE]));
        if let Err(error) = self.output(command, None).await {
            debug!(error = %error, "failed to kill tty shell in pod");
        }
    }

    async fn cleanup(&self, _runtime: &StepRuntime) {
        let (name, delete, created) = {
            let state = self.state();
            (state.name.clone(), state.delete, state.created)
        };
        if !created || !delete {
            return;
        }
        let mut command = self.kubectl();
        command.args(["delete", "pod", &name, "--ignore-not-found", "--wait=false"]);
        match self.output(command, None).await {
            Ok(_) => debug!(pod = %name, "pod deleted"),
            Err(error) => warn!(pod = %name, error = %error, "failed to delete pod"),
        }
    }

    fn supports_detached_tty(&self) -> bool {
        true
    }
}

/// DNS-1123 label derived from the agent and step ids.
fn pod_name(agent_id: &str, step_id: &str) -> String {
    dns_label(&format!("flowci-{agent_id}-{step_id}"))
}

fn dns_label(input: &str) -> String {
    let mapped: String = input
        .to_ascii_lowercase()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '-' })
        .collect();
    let truncated: String = mapped.chars().take(MAX_NAME_LEN).collect();
    truncated.trim_matches('-').to_string()
}

fn env_list(variables: &VariableStore) -> Vec<Value> {
    variables.iter().map(|(name, value)| json!({ "name": name, "value": value })).collect()
}

fn container_port(port: &str) -> Option<u16> {
    let container = port.rsplit(':').next()?;
    container.split('/').next()?.parse().ok()
}

/// Pod manifest with the runtime container first, plus the container names in that order.
fn pod_manifest(runtime: &StepRuntime, name: &str, runtime_index: usize) -> Result<(Value, Vec<String>), ExecutorError> {
    let step = runtime.step();
    let mut order: Vec<usize> = vec![runtime_index];
    order.extend((0..step.dockers.len()).filter(|index| *index != runtime_index));

    let mut containers = Vec::with_capacity(order.len());
    let mut names = Vec::with_capacity(order.len());
    for (position, index) in order.into_iter().enumerate() {
        let spec = &step.dockers[index];
        let is_runtime = position == 0;
        let container_name = if is_runtime {
            RUNTIME_CONTAINER.to_string()
        } else {
            spec.name
                .as_deref()
                .map(dns_label)
                .filter(|label| !label.is_empty())
                .unwrap_or_else(|| format!("sidecar-{index}"))
        };
        containers.push(container_manifest(runtime, spec, &container_name, is_runtime)?);
        names.push(format!("{name}/{container_name}"));
    }

    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "labels": {
                "flow.ci/agent": dns_label(&runtime.context().agent_id),
                "flow.ci/step": dns_label(&step.id),
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": containers,
            "volumes": [{ "name": WORKSPACE_VOLUME, "emptyDir": {} }],
        },
    });
    Ok((manifest, names))
}

fn container_manifest(runtime: &StepRuntime, spec: &ContainerSpec, name: &str, is_runtime: bool) -> Result<Value, ExecutorError> {
    let mut environment = VariableStore::new();
    if is_runtime {
        environment.merge(&runtime.variables());
    }
    for (key, value) in spec.environment.iter() {
        environment.set(key, runtime.expand(value))?;
    }

    let mut container = json!({
        "name": name,
        "image": normalize_image(&runtime.expand(&spec.image)),
        "env": env_list(&environment),
        "volumeMounts": [{ "name": WORKSPACE_VOLUME, "mountPath": CONTAINER_WORKSPACE }],
    });
    let entrypoint = if is_runtime && spec.entrypoint.is_empty() {
        vec![DEFAULT_ENTRYPOINT.to_string()]
    } else {
        spec.entrypoint.clone()
    };
    if !entrypoint.is_empty() {
        container["command"] = json!(entrypoint);
    }
    if !spec.command.is_empty() {
        container["args"] = json!(spec.command);
    }
    let ports: Vec<Value> = spec
        .ports
        .iter()
        .filter_map(|port| container_port(port))
        .map(|port| json!({ "containerPort": port }))
        .collect();
    if !ports.is_empty() {
        container["ports"] = Value::Array(ports);
    }
    if is_runtime {
        container["stdin"] = json!(true);
        container["tty"] = json!(true);
        container["workingDir"] = json!(format!("{CONTAINER_WORKSPACE}/{}", runtime.step().flow_id));
    }
    Ok(container)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowci_types::StepIn;

    use crate::context::AgentContext;
    use crate::logging::LogMultiplexer;

    #[test]
    fn pod_names_are_dns_labels() {
        assert_eq!(pod_name("Agent_1", "Step.42"), "flowci-agent-1-step-42");
        assert!(pod_name("a", &"x".repeat(100)).len() <= MAX_NAME_LEN);
    }

    #[test]
    fn container_ports() {
        assert_eq!(container_port("8080:80/tcp"), Some(80));
        assert_eq!(container_port("5432"), Some(5432));
        assert_eq!(container_port("http"), None);
    }

    #[tokio::test]
    async fn manifest_puts_runtime_first() {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(AgentContext::new("a1", dir.path()));
        let log = Arc::new(LogMultiplexer::open("s1", dir.path(), false, None).await.unwrap());
        let mut step = StepIn::new("s1", vec![]);
        let mut db = ContainerSpec::new("mysql:5.6");
        db.name = Some("db".into());
        db.ports = vec!["3306".into()];
        let mut app = ContainerSpec::new("ubuntu:18.04");
        app.is_runtime = true;
        step.dockers = vec![db, app];
        let runtime = StepRuntime::new(step, context, log);

        let (manifest, names) = pod_manifest(&runtime, "flowci-a1-s1", 1).unwrap();
        let containers = manifest["spec"]["containers"].as_array().unwrap();
        assert_eq!(containers[0]["name"], "runtime");
        assert_eq!(containers[0]["image"], "docker.io/library/ubuntu:18.04");
        assert_eq!(containers[0]["command"][0], "/bin/bash");
        assert_eq!(containers[0]["workingDir"], "/ws/flow");
        assert_eq!(containers[1]["name"], "db");
        assert_eq!(containers[1]["ports"][0]["containerPort"], 3306);
        assert!(containers[1].get("command").is_none());
        assert_eq!(names, vec!["flowci-a1-s1/runtime".to_string(), "flowci-a1-s1/db".to_string()]);
    }

    #[test]
    fn cache_copies_target_the_runtime_container() {
        let backend = K8sBackend::new(K8sSettings {
            namespace: "ci".into(),
            ..K8sSettings::default()
        });
        backend.state().name = "flowci-a1-s1".into();
        let command = backend.cp("/agent/caches/s1", "flowci-a1-s1:/ws/flow");
        let args: Vec<_> = command.as_std().get_args().map(|arg| arg.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            ["--namespace", "ci", "cp", "/agent/caches/s1", "flowci-a1-s1:/ws/flow", "-c", "runtime"]
        );
    }
}
