//! Agent-wide configuration and shared state carried into every step.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flowci_types::DataVolumeSpec;
use tokio::sync::Mutex;

/// Name of the bridge network every container group joins.
pub const DEFAULT_NETWORK: &str = "flow-ci-agent-default";

/// Mount point of the agent volume inside container backends.
pub const CONTAINER_WORKSPACE: &str = "/ws";

/// Plugin directory inside container backends.
pub const CONTAINER_PLUGIN_DIR: &str = "/ws/.plugins";

const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

/// Kubernetes settings for the pod backend.
#[derive(Debug, Clone)]
pub struct K8sSettings {
    pub enabled: bool,
    pub namespace: String,
    /// Path or name of the `kubectl` binary.
    pub kubectl: String,
}

impl Default for K8sSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "default".to_string(),
            kubectl: "kubectl".to_string(),
        }
    }
}

/// Explicit agent configuration, built once by the binary.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Identifier assigned by the controller on connect.
    pub agent_id: String,
    /// Root of the per-flow working directories.
    pub workspace: PathBuf,
    pub logging_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub bin_dir: PathBuf,
    /// Host staging area for caches of container steps.
    pub cache_dir: PathBuf,
    /// Seeded data volumes declared for this agent.
    pub volumes: Vec<DataVolumeSpec>,
    pub k8s: K8sSettings,
    pub docker_host: String,
    /// Mirror untransformed output into `<stepId>.raw.log`.
    pub raw_log: bool,
    pub log_queue_capacity: usize,
    pub shutdown_timeout: Duration,
    seeded_volumes: Arc<Mutex<HashSet<String>>>,
}

impl AgentContext {
    /// Creates a context rooted at `workspace` with default settings.
    pub fn new(agent_id: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            agent_id: agent_id.into(),
            logging_dir: workspace.join("logs"),
            plugin_dir: workspace.join("plugins"),
            bin_dir: workspace.join("bin"),
            cache_dir: workspace.join("caches"),
            workspace,
            volumes: Vec::new(),
            k8s: K8sSettings::default(),
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            raw_log: false,
            log_queue_capacity: DEFAULT_LOG_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            seeded_volumes: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Creates the workspace, logging, plugin, bin and cache directories.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [&self.workspace, &self.logging_dir, &self.plugin_dir, &self.bin_dir, &self.cache_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Host working directory of a flow.
    pub fn flow_dir(&self, flow_id: &str) -> PathBuf {
        self.workspace.join(flow_id)
    }

    /// Host path of a materialized plugin.
    pub fn plugin_path(&self, plugin: &str) -> PathBuf {
        self.plugin_dir.join(plugin)
    }

    /// Host directory a container step's cache is staged in.
    pub fn cache_staging_dir(&self, step_id: &str) -> PathBuf {
        self.cache_dir.join(step_id)
    }

    /// Name of the per-agent volume mounted at `/ws`.
    pub fn agent_volume(&self) -> String {
        format!("agent-{}", self.agent_id)
    }

    /// Unix socket of the Docker engine, when `docker_host` names one.
    pub fn docker_socket(&self) -> Option<&Path> {
        self.docker_host.strip_prefix("unix://").map(Path::new)
    }

    /// Agent-wide set of data volumes already seeded during this process lifetime.
    pub(crate) fn seeded_volumes(&self) -> &Mutex<HashSet<String>> {
        &self.seeded_volumes
    }
}
