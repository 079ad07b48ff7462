//! Command line arguments and the agent context built from them.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use flowci_engine::context::DEFAULT_DOCKER_HOST;
use flowci_engine::{AgentContext, K8sSettings};
use flowci_types::parse_volume_specs;
use flowci_util::{default_workspace, expand_tilde};

/// Default clone URL of a plugin; `{name}` is replaced by the plugin name.
pub const DEFAULT_PLUGIN_URL: &str = "https://github.com/flowci-plugins/{name}.git";

#[derive(Debug, Parser)]
#[command(name = "flowci-agent", version, about = "flow.ci build agent")]
pub struct Args {
    /// Controller base URL. Plain `http://` only, TLS is not supported.
    #[arg(long, env = "FLOWCI_SERVER_URL")]
    pub server_url: String,

    /// Agent token issued by the controller.
    #[arg(long, env = "FLOWCI_AGENT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Port reported to the controller.
    #[arg(long, env = "FLOWCI_AGENT_PORT", default_value_t = 0)]
    pub port: u16,

    /// Workspace directory, `~/.flow.ci.agent` by default.
    #[arg(long, env = "FLOWCI_AGENT_WORKSPACE")]
    pub workspace: Option<String>,

    /// Data volumes: `name=..,dest=..,script=..,image=..,init=..;...`
    #[arg(long, env = "FLOWCI_AGENT_VOLUMES")]
    pub volumes: Option<String>,

    /// Run container steps as Kubernetes pods.
    #[arg(long, env = "FLOWCI_AGENT_K8S_ENABLED")]
    pub k8s_enabled: bool,

    #[arg(long, env = "FLOWCI_AGENT_K8S_NAMESPACE", default_value = "default")]
    pub k8s_namespace: String,

    #[arg(long, default_value = "kubectl")]
    pub kubectl: String,

    #[arg(long, env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    pub docker_host: String,

    /// Also persist unprocessed step output next to the log.
    #[arg(long, env = "FLOWCI_AGENT_RAW_LOG")]
    pub raw_log: bool,

    /// Clone URL template of plugins.
    #[arg(long, env = "FLOWCI_AGENT_PLUGIN_URL", default_value = DEFAULT_PLUGIN_URL)]
    pub plugin_url: String,

    #[arg(long, default_value_t = 1000)]
    pub log_queue_capacity: usize,

    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    pub profile_interval_secs: u64,
}

impl Args {
    pub fn workspace_dir(&self) -> PathBuf {
        match self.workspace.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => expand_tilde(path),
            _ => default_workspace(),
        }
    }

    pub fn profile_interval(&self) -> Duration {
        Duration::from_secs(self.profile_interval_secs.max(1))
    }

    /// Builds the context of agent `agent_id`.
    pub fn context(&self, agent_id: &str) -> Result<AgentContext> {
        let mut context = AgentContext::new(agent_id, self.workspace_dir());
        if let Some(volumes) = self.volumes.as_deref() {
            context.volumes = parse_volume_specs(volumes).context("parse FLOWCI_AGENT_VOLUMES")?;
        }
        context.k8s = K8sSettings {
            enabled: self.k8s_enabled,
            namespace: self.k8s_namespace.clone(),
            kubectl: self.kubectl.clone(),
        };
        context.docker_host = self.docker_host.clone();
        context.raw_log = self.raw_log;
        context.log_queue_capacity = self.log_queue_capacity.max(1);
        context.shutdown_timeout = Duration::from_secs(self.shutdown_timeout_secs);
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [(&str, Option<&str>); 2] = [("FLOWCI_SERVER_URL", Some("http://ci.local:8080")), ("FLOWCI_AGENT_TOKEN", Some("secret"))];

    #[test]
    fn reads_settings_from_environment() {
        let vars = [
            REQUIRED[0],
            REQUIRED[1],
            ("FLOWCI_AGENT_WORKSPACE", Some("/srv/agent")),
            ("FLOWCI_AGENT_K8S_ENABLED", Some("true")),
            ("FLOWCI_AGENT_K8S_NAMESPACE", Some("ci")),
            ("FLOWCI_AGENT_VOLUMES", Some("name=1,dest=/data,script=init.sh,image=,init=;")),
            ("DOCKER_HOST", Some("tcp://127.0.0.1:2375")),
        ];
        temp_env::with_vars(vars, || {
            let args = Args::try_parse_from(["flowci-agent"]).unwrap();
            assert_eq!(args.server_url, "http://ci.local:8080");
            let context = args.context("a1").unwrap();
            assert_eq!(context.workspace, PathBuf::from("/srv/agent"));
            assert_eq!(context.logging_dir, PathBuf::from("/srv/agent/logs"));
            assert!(context.k8s.enabled);
            assert_eq!(context.k8s.namespace, "ci");
            assert_eq!(context.volumes.len(), 1);
            assert_eq!(context.docker_host, "tcp://127.0.0.1:2375");
        });
    }

    #[test]
    fn defaults_apply_without_optional_settings() {
        let vars = [
            REQUIRED[0],
            REQUIRED[1],
            ("FLOWCI_AGENT_WORKSPACE", None),
            ("FLOWCI_AGENT_K8S_ENABLED", None),
            ("FLOWCI_AGENT_VOLUMES", None),
            ("DOCKER_HOST", None),
        ];
        temp_env::with_vars(vars, || {
            let args = Args::try_parse_from(["flowci-agent"]).unwrap();
            let context = args.context("a1").unwrap();
            assert_eq!(context.workspace, default_workspace());
            assert!(!context.k8s.enabled);
            assert_eq!(context.docker_host, DEFAULT_DOCKER_HOST);
            assert_eq!(context.shutdown_timeout, Duration::from_secs(10));
            assert_eq!(args.plugin_url, DEFAULT_PLUGIN_URL);
        });
    }

    #[test]
    fn malformed_volumes_are_rejected() {
        temp_env::with_vars([REQUIRED[0], REQUIRED[1], ("FLOWCI_AGENT_VOLUMES", Some("name=1,dest=/d"))], || {
            let args = Args::try_parse_from(["flowci-agent"]).unwrap();
            assert!(args.context("a1").is_err());
        });
    }

    #[test]
    fn server_url_is_required() {
        temp_env::with_vars([("FLOWCI_SERVER_URL", None::<&str>), ("FLOWCI_AGENT_TOKEN", Some("secret"))], || {
            assert!(Args::try_parse_from(["flowci-agent"]).is_err());
        });
    }
}
