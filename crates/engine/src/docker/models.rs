//! Request and response bodies of the Docker Engine API subset the agent uses.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub image: String,
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Map<String, Value>>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub open_stdin: bool,
    pub tty: bool,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub binds: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IdResponse {
    pub id: String,
}

/// Subset of `GET /containers/{id}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
    #[serde(default)]
    pub network_settings: NetworkSettings,
}

impl ContainerInspect {
    /// Addresses on every attached network, sorted by network name.
    pub fn ip_addresses(&self) -> Vec<String> {
        let mut networks: Vec<(&String, &EndpointSettings)> = self.network_settings.networks.iter().collect();
        networks.sort_by(|left, right| left.0.cmp(right.0));
        networks
            .into_iter()
            .map(|(_, endpoint)| endpoint.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: i64,
}

impl ContainerState {
    pub fn is_exited(&self) -> bool {
        self.status == "exited"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub networks: HashMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    pub ip_address: String,
}

/// Body of `POST /containers/{id}/exec`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecConfig {
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ExecConfig {
    /// Exec with every stdio stream attached.
    pub fn attached(cmd: Vec<String>, tty: bool) -> Self {
        Self {
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty,
            cmd,
            ..Self::default()
        }
    }

    /// Fire-and-forget exec.
    pub fn detached(cmd: Vec<String>) -> Self {
        Self {
            cmd,
            ..Self::default()
        }
    }
}

/// Subset of `GET /exec/{id}/json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecInspect {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub pid: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    pub status_code: i64,
}

/// One line of the image pull progress stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullProgress {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub progress: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PullProgress {
    /// Human readable log line.
    pub fn line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            parts.push(format!("{id}:"));
        }
        if let Some(status) = self.status.as_deref() {
            parts.push(status.to_string());
        }
        if let Some(progress) = self.progress.as_deref().filter(|progress| !progress.is_empty()) {
            parts.push(progress.to_string());
        }
        parts.join(" ")
    }
}

/// Error body returned by the engine.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_config_uses_engine_field_names() {
        let mut config = ContainerConfig {
            image: "docker.io/library/ubuntu:18.04".into(),
            working_dir: Some("/ws/flow".into()),
            ..ContainerConfig::default()
        };
        config.exposed_ports.insert("80/tcp".into(), Map::new());
        config.host_config.binds.push("agent-a1:/ws".into());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["Image"], "docker.io/library/ubuntu:18.04");
        assert_eq!(value["WorkingDir"], "/ws/flow");
        assert_eq!(value["HostConfig"]["Binds"][0], "agent-a1:/ws");
        assert!(value["ExposedPorts"]["80/tcp"].is_object());
        assert!(value.get("Cmd").is_none());
    }

    #[test]
    fn inspect_reads_state_and_addresses() {
        let inspect: ContainerInspect = serde_json::from_str(
            r#"{"Id":"abc","State":{"Status":"exited","Running":false,"ExitCode":0},
                "NetworkSettings":{"Networks":{"flow-ci-agent-default":{"IPAddress":"172.18.0.2"},"bridge":{"IPAddress":"172.17.0.3"}}}}"#,
        )
        .unwrap();
        assert!(inspect.state.is_exited());
        assert_eq!(inspect.ip_addresses(), vec!["172.17.0.3".to_string(), "172.18.0.2".to_string()]);
    }

    #[test]
    fn pull_progress_line() {
        let progress: PullProgress =
            serde_json::from_str(r#"{"status":"Downloading","progressDetail":{},"progress":"[=>  ] 1MB/5MB","id":"a1b2"}"#).unwrap();
        assert_eq!(progress.line(), "a1b2: Downloading [=>  ] 1MB/5MB");
    }
}
