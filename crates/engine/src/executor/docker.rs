//! Container backend.
//!
//! A step runs as a group of containers on the local Docker engine. The
//! runtime container keeps an idle shell alive; the step script is fed to a
//! second shell started through an attached exec, so interactive sessions and
//! kill requests can reach the same container through sibling execs.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowci_types::{ContainerSpec, DataVolumeSpec, LogKind, VOLUME_SEED_TARGET, VariableStore, exit_code};
use flowci_util::parse_unix_env;
use serde_json::Map;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::cache;
use crate::context::{CONTAINER_PLUGIN_DIR, CONTAINER_WORKSPACE, DEFAULT_NETWORK};
use crate::demux::{DemuxReader, StreamKind};
use crate::docker::{ContainerConfig, DockerClient, ExecConfig, HostConfig, PortBinding, normalize_image};
use crate::error::{DockerError, ExecutorError};
use crate::executor::script::{self, ENV_FILE, SHELL_PID_FILE, TTY_PID_FILE};
use crate::executor::shell::READER_GRACE;
use crate::executor::{Backend, BackendKind, StepRuntime, TtySession};
use crate::logging::{LineSplitter, LogMultiplexer};

const PULL_ATTEMPTS: usize = 3;
const EXEC_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_ENTRYPOINT: &str = "/bin/bash";
const DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// A container of the step group, ready to be created.
#[derive(Debug, Clone)]
struct PreparedContainer {
    name: Option<String>,
    config: ContainerConfig,
    resume_id: Option<String>,
    stop: bool,
    delete: bool,
}

#[derive(Debug, Default)]
struct DockerState {
    prepared: Vec<PreparedContainer>,
    runtime_index: usize,
    /// Ids of started containers in declaration order.
    containers: Vec<String>,
}

/// Runs steps inside containers managed through the Docker Engine API.
#[derive(Debug)]
pub struct DockerBackend {
    client: DockerClient,
    state: Mutex<DockerState>,
}

impl DockerBackend {
    pub fn new(client: DockerClient) -> Self {
        Self {
            client,
            state: Mutex::new(DockerState::default()),
        }
    }

    /// Backend bound to the engine at `docker_host`.
    pub fn connect(docker_host: &str) -> Result<Self, ExecutorError> {
        Ok(Self::new(DockerClient::connect(docker_host)?))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DockerState> {
        self.state.lock().expect("docker state lock")
    }

    fn runtime_container(&self) -> Option<(String, Vec<String>)> {
        let state = self.state();
        let id = state.containers.get(state.runtime_index)?.clone();
        let shell = state.prepared.get(state.runtime_index)?.config.entrypoint.clone();
        Some((id, shell))
    }

    async fn prime_volumes(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let context = runtime.context();
        let mut seeded = context.seeded_volumes().lock().await;
        for volume in context.volumes.iter().filter(|volume| volume.has_seed()) {
            if seeded.contains(&volume.name) {
                continue;
            }
            if !self.client.volume_exists(&volume.name).await? {
                info!(volume = %volume.name, image = %volume.image, "seeding data volume");
                self.seed_volume(runtime.log(), volume).await?;
            }
            seeded.insert(volume.name.clone());
        }
        Ok(())
    }

    async fn seed_volume(&self, log: &LogMultiplexer, volume: &DataVolumeSpec) -> Result<(), ExecutorError> {
        let image = normalize_image(&volume.image);
        self.pull(log, &image).await?;
        self.ensure_volume(&volume.name).await?;

        let config = ContainerConfig {
            image,
            cmd: vec!["/bin/sh".to_string(), volume.init_script_path()],
            host_config: HostConfig {
                binds: vec![format!("{}:{VOLUME_SEED_TARGET}", volume.name)],
                ..HostConfig::default()
            },
            ..ContainerConfig::default()
        };
        let id = self.client.create_container(None, &config).await?;
        let outcome = async {
            self.client.start_container(&id).await?;
            self.client.wait_container(&id).await
        }
        .await;
        if let Err(error) = self.client.remove_container(&id, true).await {
            warn!(container_id = %id, error = %error, "failed to remove volume seeding container");
        }
        match outcome? {
            0 => Ok(()),
            code => Err(ExecutorError::backend(format!("seeding volume {} exited with code {code}", volume.name))),
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<(), DockerError> {
        if self.client.volume_exists(name).await? {
            return Ok(());
        }
        match self.client.create_volume(name).await {
            Err(error) if error.is_conflict() => Ok(()),
            other => other,
        }
    }

    async fn ensure_network(&self, name: &str) -> Result<(), DockerError> {
        if self.client.network_exists(name).await? {
            return Ok(());
        }
        info!(network = name, "creating agent network");
        match self.client.create_network(name).await {
            Err(error) if error.is_conflict() => Ok(()),
            other => other,
        }
    }

    /// Pulls `image`, streaming progress into the step log.
    async fn pull(&self, log: &LogMultiplexer, image: &str) -> Result<(), ExecutorError> {
        let mut last_error = None;
        for attempt in 1..=PULL_ATTEMPTS {
            match self.pull_once(log, image).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(image, attempt, error = %error, "image pull failed");
                    last_error = Some(error);
                }
            }
        }
        let detail = last_error.map(|error| error.to_string()).unwrap_or_default();
        Err(ExecutorError::backend(format!("failed to pull {image}: {detail}")))
    }

    async fn pull_once(&self, log: &LogMultiplexer, image: &str) -> Result<(), DockerError> {
        let mut progress = self.client.pull_image(image).await?;
        while let Some(item) = progress.next().await? {
            let line = item.line();
            if !line.is_empty() {
                log.write_text(LogKind::Out, &line).await?;
            }
        }
        Ok(())
    }

    /// Pulls and starts every container once per step; retries reuse them.
    async fn ensure_containers(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let (prepared, started) = {
            let state = self.state();
            (state.prepared.clone(), state.containers.len())
        };
        for container in prepared.iter().skip(started) {
            self.pull(runtime.log(), &container.config.image).await?;
            let id = self.start_or_resume(container).await?;
            info!(container_id = %id, image = %container.config.image, "container started");
            let containers = {
                let mut state = self.state();
                state.containers.push(id);
                state.containers.clone()
            };
            runtime.set_containers(containers);
        }
        if started == 0 {
            self.copy_plugin(runtime).await?;
            self.import_cache(runtime).await?;
        }
        Ok(())
    }

    async fn start_or_resume(&self, container: &PreparedContainer) -> Result<String, DockerError> {
        if let Some(id) = container.resume_id.as_deref() {
            match self.client.inspect_container(id).await {
                Err(error) if error.is_not_found() => debug!(container_id = id, "container to resume is gone"),
                Err(error) => return Err(error),
                Ok(inspect) if !inspect.state.is_exited() => {
                    debug!(container_id = id, status = %inspect.state.status, "container not exited; creating a new one");
                }
                Ok(_) => match self.client.restart_container(id).await {
                    Ok(()) => return Ok(id.to_string()),
                    Err(error) => {
                        warn!(container_id = id, error = %error, "restart failed; replacing container");
                        if let Err(error) = self.client.remove_container(id, true).await {
                            warn!(container_id = id, error = %error, "failed to remove container");
                        }
                    }
                },
            }
        }
        let id = self.client.create_container(container.name.as_deref(), &container.config).await?;
        self.client.start_container(&id).await?;
        Ok(id)
    }

    /// Copies the step plugin into the runtime container.
    async fn copy_plugin(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let Some(plugin) = runtime.step().plugin.as_deref() else {
            return Ok(());
        };
        let Some((container_id, _)) = self.runtime_container() else {
            return Err(ExecutorError::NotRunning);
        };
        let target = format!("{CONTAINER_PLUGIN_DIR}/{plugin}");
        let prepare = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("rm -rf '{target}' && mkdir -p {CONTAINER_PLUGIN_DIR}"),
        ];
        self.exec_output(&container_id, prepare).await?;

        let source = runtime.context().plugin_path(plugin);
        docker_cp(runtime, &source.display().to_string(), &format!("{container_id}:{target}")).await?;
        debug!(plugin, container_id = %container_id, "plugin copied");
        Ok(())
    }

    /// Copies the restored cache into the runtime container's work dir.
    async fn import_cache(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let staging = self.cache_dir(runtime);
        if runtime.step().cache.is_none() || !cache::is_populated(&staging).await {
            return Ok(());
        }
        let (container_id, _) = self.runtime_container().ok_or(ExecutorError::NotRunning)?;
        let (_, work_dir, _) = self.script_paths(runtime);
        let source = format!("{}/.", staging.display());
        docker_cp(runtime, &source, &format!("{container_id}:{work_dir}")).await?;
        debug!(container_id = %container_id, work_dir = %work_dir, "cache copied into container");
        Ok(())
    }

    /// `FLOWCI_DOCKER_<i>_ID` and `_IP` exports for every container.
    async fn container_exports(&self) -> Result<Vec<(String, String)>, DockerError> {
        let containers = self.state().containers.clone();
        let mut exports = Vec::with_capacity(containers.len() * 2);
        for (index, id) in containers.iter().enumerate() {
            let inspect = self.client.inspect_container(id).await?;
            exports.push((format!("FLOWCI_DOCKER_{index}_ID"), id.clone()));
            exports.push((format!("FLOWCI_DOCKER_{index}_IP"), inspect.ip_addresses().join(",")));
        }
        Ok(exports)
    }

    async fn run_script(&self, runtime: &StepRuntime, container_id: &str, shell: Vec<String>, script: String) -> Result<i32, ExecutorError> {
        let exec_id = self.client.create_exec(container_id, &ExecConfig::attached(shell, false)).await?;
        let stream = self.client.start_exec_attached(&exec_id, false).await?;
        let (reader, mut writer) = tokio::io::split(stream);
        let mut pump = spawn_output_pump(reader, runtime.log().clone());

        writer.write_all(script.as_bytes()).await?;
        writer.flush().await?;
        if let Err(error) = writer.shutdown().await {
            debug!(error = %error, "exec stdin already closed");
        }

        let cancel = runtime.cancel_token();
        tokio::select! {
            _ = &mut pump => {}
            _ = cancel.cancelled() => {
                pump.abort();
                return Err(ExecutorError::Cancelled);
            }
        }

        loop {
            let inspect = self.client.inspect_exec(&exec_id).await?;
            if inspect.pid > 0 {
                runtime.set_process_id(u32::try_from(inspect.pid).ok());
            }
            if !inspect.running {
                let code = inspect.exit_code.map_or(exit_code::UNKNOWN, |code| code as i32);
                debug!(exec_id = %exec_id, code, "step shell exited");
                return Ok(code);
            }
            tokio::select! {
                _ = tokio::time::sleep(EXEC_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }
    }

    /// Runs `cmd` in `container_id` and returns its stdout.
    async fn exec_output(&self, container_id: &str, cmd: Vec<String>) -> Result<Vec<u8>, ExecutorError> {
        let mut config = ExecConfig::attached(cmd, false);
        config.attach_stdin = false;
        let exec_id = self.client.create_exec(container_id, &config).await?;
        let stream = self.client.start_exec_attached(&exec_id, false).await?;
        let mut reader = DemuxReader::new(stream);
        let mut stdout = Vec::new();
        while let Some(record) = reader.next().await? {
            if record.kind != StreamKind::Stderr {
                stdout.extend_from_slice(&record.payload);
            }
        }
        Ok(stdout)
    }

    /// Fire-and-forget exec in the runtime container.
    async fn exec_detached(&self, cmd: Vec<String>) {
        let Some((container_id, _)) = self.runtime_container() else {
            return;
        };
        let outcome = async {
            let exec_id = self.client.create_exec(&container_id, &ExecConfig::detached(cmd)).await?;
            self.client.start_exec_detached(&exec_id).await
        }
        .await;
        if let Err(error) = outcome {
            warn!(container_id = %container_id, error = %error, "detached exec failed");
        }
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
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
        let prepared = step
            .dockers
            .iter()
            .enumerate()
            .map(|(index, spec)| prepare_container(runtime, spec, index == runtime_index))
            .collect::<Result<Vec<_>, _>>()?;

        self.client.ping().await?;
        self.prime_volumes(runtime).await?;
        self.ensure_network(DEFAULT_NETWORK).await?;
        self.ensure_volume(&runtime.context().agent_volume()).await?;

        let mut state = self.state();
        state.prepared = prepared;
        state.runtime_index = runtime_index;
        state.containers.clear();
        Ok(())
    }

    async fn run(&self, runtime: &StepRuntime) -> Result<i32, ExecutorError> {
        tokio::select! {
            outcome = self.ensure_containers(runtime) => outcome?,
            _ = runtime.cancel_token().cancelled() => return Err(ExecutorError::Cancelled),
        }
        let (container_id, shell) = self.runtime_container().ok_or(ExecutorError::NotRunning)?;
        let exports = self.container_exports().await?;
        let script = script::container_script(&exports, &runtime.context().volumes, &runtime.step().scripts);
        self.run_script(runtime, &container_id, shell, script).await
    }

    async fn collect_env(&self, _runtime: &StepRuntime) -> Result<VariableStore, ExecutorError> {
        let (container_id, _) = self.runtime_container().ok_or(ExecutorError::NotRunning)?;
        let output = self.exec_output(&container_id, vec!["cat".to_string(), ENV_FILE.to_string()]).await?;
        Ok(parse_unix_env(&String::from_utf8_lossy(&output)))
    }

    async fn export_cache(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        let Some(spec) = runtime.step().cache.as_ref() else {
            return Ok(());
        };
        let (container_id, _) = self.runtime_container().ok_or(ExecutorError::NotRunning)?;
        let (_, work_dir, _) = self.script_paths(runtime);
        let staging = self.cache_dir(runtime);
        cache::reset_dir(&staging).await?;
        for (source, dest) in cache::export_targets(&work_dir, &staging, &spec.paths) {
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            if let Err(error) = docker_cp(runtime, &format!("{container_id}:{source}"), &dest.display().to_string()).await {
                debug!(path = %source, error = %error, "cache path not copied");
            }
        }
        Ok(())
    }

    async fn abort(&self, _runtime: &StepRuntime) {
        self.exec_detached(script::kill_command(&[SHELL_PID_FILE, TTY_PID_FILE])).await;
    }

    async fn open_tty(&self, _runtime: &StepRuntime, mut session: TtySession) -> Result<(), ExecutorError> {
        let (container_id, shell) = self.runtime_container().ok_or(ExecutorError::NotRunning)?;
        let exec_id = self.client.create_exec(&container_id, &ExecConfig::attached(shell, true)).await?;
        let stream = self.client.start_exec_attached(&exec_id, true).await?;
        let (reader, mut writer) = tokio::io::split(stream);
        writer.write_all(script::tty_preamble().as_bytes()).await?;
        writer.flush().await?;
        session.started();

        let output = session.output_sender();
        let mut pump = tokio::spawn(async move {
            let mut reader = DemuxReader::new(reader);
            while let Ok(Some(record)) = reader.next().await {
                if !output.send(&record.payload).await {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                line = session.input.recv() => {
                    let Some(line) = line else { break };
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
                _ = &mut pump => return Ok(()),
                _ = session.token.cancelled() => break,
            }
        }

        let _ = writer.shutdown().await;
        if tokio::time::timeout(READER_GRACE, &mut pump).await.is_err() {
            pump.abort();
        }
        Ok(())
    }

    async fn stop_tty(&self, _runtime: &StepRuntime) {
        self.exec_detached(script::kill_command(&[TTY_PID_FILE])).await;
    }

    async fn cleanup(&self, _runtime: &StepRuntime) {
        let (prepared, containers) = {
            let state = self.state();
            (state.prepared.clone(), state.containers.clone())
        };
        for (container, id) in prepared.iter().zip(containers.iter()) {
            let outcome = if container.delete {
                self.client.remove_container(id, true).await
            } else if container.stop {
                self.client.stop_container(id).await
            } else {
                Ok(())
            };
            match outcome {
                Ok(()) => debug!(container_id = %id, delete = container.delete, stop = container.stop, "container cleaned up"),
                Err(error) => warn!(container_id = %id, error = %error, "container cleanup failed"),
            }
        }
    }

    fn supports_detached_tty(&self) -> bool {
        true
    }
}

/// Runs `docker cp <source> <dest>` against the agent's Docker host.
async fn docker_cp(runtime: &StepRuntime, source: &str, dest: &str) -> Result<(), ExecutorError> {
    let output = Command::new("docker")
        .env("DOCKER_HOST", &runtime.context().docker_host)
        .arg("cp")
        .arg(source)
        .arg(dest)
        .output()
        .await
        .map_err(|error| ExecutorError::backend(format!("failed to run docker cp: {error}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecutorError::backend(format!("docker cp {source} {dest} failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Builds the create request of one container of the group.
fn prepare_container(runtime: &StepRuntime, spec: &ContainerSpec, is_runtime: bool) -> Result<PreparedContainer, ExecutorError> {
    let context = runtime.context();
    let mut environment = VariableStore::new();
    if is_runtime {
        environment.merge(&runtime.variables());
    }
    for (key, value) in spec.environment.iter() {
        environment.set(key, runtime.expand(value))?;
    }

    let mut config = ContainerConfig {
        image: normalize_image(&runtime.expand(&spec.image)),
        env: environment.to_kv(),
        cmd: spec.command.clone(),
        entrypoint: spec.entrypoint.clone(),
        user: spec.user.clone(),
        ..ContainerConfig::default()
    };
    config.host_config.network_mode = Some(spec.network.clone().unwrap_or_else(|| DEFAULT_NETWORK.to_string()));
    for port in &spec.ports {
        let (container_port, binding) = port_mapping(port);
        config.exposed_ports.insert(container_port.clone(), Map::new());
        if let Some(binding) = binding {
            config.host_config.port_bindings.entry(container_port).or_default().push(binding);
        }
    }

    if is_runtime {
        if config.entrypoint.is_empty() {
            config.entrypoint = vec![DEFAULT_ENTRYPOINT.to_string()];
        }
        config.working_dir = Some(format!("{CONTAINER_WORKSPACE}/{}", runtime.step().flow_id));
        config.attach_stdin = true;
        config.attach_stdout = true;
        config.attach_stderr = true;
        config.open_stdin = true;
        config.tty = true;

        let binds = &mut config.host_config.binds;
        binds.push(format!("{}:{CONTAINER_WORKSPACE}", context.agent_volume()));
        binds.extend(context.volumes.iter().map(DataVolumeSpec::bind));
        let socket = context.docker_socket().unwrap_or(Path::new(DOCKER_SOCKET));
        if cfg!(windows) || socket.exists() {
            binds.push(format!("{}:{DOCKER_SOCKET}", socket.display()));
        }
    }

    Ok(PreparedContainer {
        name: spec.name.as_deref().map(|name| runtime.expand(name)),
        config,
        resume_id: spec.resume_id().map(str::to_string),
        stop: spec.is_stop_container,
        delete: spec.is_delete_container,
    })
}

/// Splits `[ip:][host:]container[/proto]` into the exposed port key and its binding.
fn port_mapping(port: &str) -> (String, Option<PortBinding>) {
    let (host, container) = match port.rsplit_once(':') {
        Some((host, container)) => (Some(host), container),
        None => (None, port),
    };
    let container = if container.contains('/') {
        container.to_string()
    } else {
        format!("{container}/tcp")
    };
    let binding = host.map(|host| match host.rsplit_once(':') {
        Some((ip, host_port)) => PortBinding {
            host_ip: ip.to_string(),
            host_port: host_port.to_string(),
        },
        None => PortBinding {
            host_ip: String::new(),
            host_port: host.to_string(),
        },
    });
    (container, binding)
}

/// Forwards a multiplexed exec stream into the step log line by line.
fn spawn_output_pump<R>(reader: R, log: Arc<LogMultiplexer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = DemuxReader::new(reader);
        let mut stdout = LineSplitter::new();
        let mut stderr = LineSplitter::new();
        loop {
            let record = match reader.next().await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(error) => {
                    debug!(error = %error, "exec stream closed");
                    break;
                }
            };
            let (splitter, kind) = match record.kind {
                StreamKind::Stderr => (&mut stderr, LogKind::Err),
                StreamKind::Stdout | StreamKind::Raw => (&mut stdout, LogKind::Out),
            };
            for line in splitter.push(&record.payload) {
                if let Err(error) = log.write_line(kind, &line).await {
                    warn!(error = %error, "failed to write step output");
                }
            }
        }
        for (splitter, kind) in [(&mut stdout, LogKind::Out), (&mut stderr, LogKind::Err)] {
            if let Some(line) = splitter.finish()
                && let Err(error) = log.write_line(kind, &line).await
            {
                warn!(error = %error, "failed to write step output");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use flowci_types::StepIn;

    use crate::context::AgentContext;

    async fn runtime(step: StepIn, context: AgentContext) -> (tempfile::TempDir, StepRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(LogMultiplexer::open(step.id.clone(), dir.path(), false, None).await.unwrap());
        let runtime = StepRuntime::new(step, Arc::new(context), log);
        let mut variables = VariableStore::new();
        variables.set("TAG", "18.04").unwrap();
        variables.set("FLOWCI_FLOW_ID", "flow").unwrap();
        runtime.set_variables(variables);
        (dir, runtime)
    }

    #[test]
    fn port_mappings() {
        assert_eq!(port_mapping("80"), ("80/tcp".to_string(), None));
        let (key, binding) = port_mapping("8080:80/udp");
        assert_eq!(key, "80/udp");
        assert_eq!(binding.unwrap().host_port, "8080");
        let binding = port_mapping("127.0.0.1:5432:5432").1.unwrap();
        assert_eq!((binding.host_ip.as_str(), binding.host_port.as_str()), ("127.0.0.1", "5432"));
    }

    #[tokio::test]
    async fn runtime_container_mounts_workspace_and_defaults_entrypoint() {
        let mut context = AgentContext::new("a1", "/tmp/agent");
        context.docker_host = "unix:///nonexistent/docker.sock".into();
        context.volumes = vec![DataVolumeSpec {
            name: "jdk".into(),
            dest: "/opt/jdk".into(),
            ..DataVolumeSpec::default()
        }];
        let mut spec = ContainerSpec::new("ubuntu:${TAG}");
        spec.environment.set("GREETING", "hi").unwrap();
        let (_dir, runtime) = runtime(StepIn::new("s1", vec![]), context).await;

        let prepared = prepare_container(&runtime, &spec, true).unwrap();
        let config = &prepared.config;
        assert_eq!(config.image, "docker.io/library/ubuntu:18.04");
        assert_eq!(config.entrypoint, vec!["/bin/bash".to_string()]);
        assert_eq!(config.working_dir.as_deref(), Some("/ws/flow"));
        assert!(config.env.contains(&"TAG=18.04".to_string()));
        assert!(config.env.contains(&"GREETING=hi".to_string()));
        if cfg!(windows) {
            assert_eq!(config.host_config.binds.len(), 3);
        } else {
            assert_eq!(config.host_config.binds, vec!["agent-a1:/ws".to_string(), "jdk:/opt/jdk".to_string()]);
        }
        assert_eq!(config.host_config.network_mode.as_deref(), Some(DEFAULT_NETWORK));
        assert!(prepared.stop && prepared.delete);
    }

    #[tokio::test]
    async fn cache_is_staged_outside_the_flow_dir() {
        let context = AgentContext::new("a1", "/tmp/agent");
        let (_dir, runtime) = runtime(StepIn::new("s1", vec![]), context).await;
        let backend = DockerBackend::new(DockerClient::connect("tcp://127.0.0.1:2375").unwrap());
        assert_eq!(backend.cache_dir(&runtime), Path::new("/tmp/agent/caches/s1"));
        assert_eq!(backend.script_paths(&runtime).1, "/ws/flow");
    }

    #[tokio::test]
    async fn sidecars_keep_their_own_environment() {
        let mut spec = ContainerSpec::new("mysql:5.6");
        spec.environment.set("MYSQL_ROOT_PASSWORD", "${TAG}").unwrap();
        spec.name = Some("db".into());
        spec.container_id = Some(" ".into());
        let (_dir, runtime) = runtime(StepIn::new("s1", vec![]), AgentContext::new("a1", "/tmp/agent")).await;

        let prepared = prepare_container(&runtime, &spec, false).unwrap();
        assert_eq!(prepared.config.env, vec!["MYSQL_ROOT_PASSWORD=18.04".to_string()]);
        assert!(prepared.config.entrypoint.is_empty());
        assert!(prepared.config.host_config.binds.is_empty());
        assert_eq!(prepared.name.as_deref(), Some("db"));
        assert_eq!(prepared.resume_id, None);
    }
}
