//! Messages exchanged with the controller.

use serde::{Deserialize, Serialize};

use crate::{StepIn, StepResult};

/// Inbound control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentCommand {
    /// Execute a step.
    Shell(StepIn),
    /// Kill the running step.
    Kill,
    /// Open, close or feed an interactive session.
    Tty(TtyIn),
    /// Shut the agent down gracefully.
    Close,
}

/// Interactive session action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtyAction {
    Open,
    Close,
    Shell,
}

/// Interactive session request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtyIn {
    pub id: String,
    pub action: TtyAction,
    /// Input line for [`TtyAction::Shell`].
    #[serde(default)]
    pub input: Option<String>,
}

/// Interactive session acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtyOut {
    pub id: String,
    pub action: TtyAction,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl TtyOut {
    pub fn ok(id: impl Into<String>, action: TtyAction) -> Self {
        Self {
            id: id.into(),
            action,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, action: TtyAction, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Host resource snapshot; memory and disk are in megabytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub cpu: u32,
    pub total_memory: u64,
    pub free_memory: u64,
    pub total_disk: u64,
    pub free_disk: u64,
}

/// Registration payload sent on connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInit {
    pub token: String,
    pub port: u16,
    pub os: String,
    pub k8s_enabled: bool,
    pub docker_enabled: bool,
    pub resource: Resource,
}

/// Agent identity returned by the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub token: String,
}

/// Settings returned by the controller on connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    pub agent: AgentInfo,
}

/// Cache entry known to the controller; `files` holds encoded names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCache {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub files: Vec<String>,
}

/// Routing headers for a shell log frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShellLogHeaders {
    /// Job id.
    pub id: String,
    pub step_id: String,
}

/// Body of a shell log frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellLogBody {
    /// Step id.
    pub id: String,
    /// Base64 encoded line.
    pub content: String,
}

/// Routing headers for a tty log frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TtyLogHeaders {
    /// Tty session id.
    pub id: String,
}

/// Outbound frame published to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ControllerFrame {
    ShellLog { headers: ShellLogHeaders, body: ShellLogBody },
    TtyLog { headers: TtyLogHeaders, body: String },
    TtyResult { body: TtyOut },
    StepResult { body: StepResult },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_commands() {
        let kill: AgentCommand = serde_json::from_str(r#"{"type":"KILL"}"#).unwrap();
        assert!(matches!(kill, AgentCommand::Kill));

        let tty: AgentCommand = serde_json::from_str(r#"{"type":"TTY","id":"t1","action":"SHELL","input":"ls"}"#).unwrap();
        match tty {
            AgentCommand::Tty(tty_in) => {
                assert_eq!(tty_in.action, TtyAction::Shell);
                assert_eq!(tty_in.input.as_deref(), Some("ls"));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let shell: AgentCommand =
            serde_json::from_str(r#"{"type":"SHELL","id":"s1","flowId":"f","jobId":"j","scripts":["echo hi"]}"#).unwrap();
        assert!(matches!(shell, AgentCommand::Shell(step) if step.scripts == vec!["echo hi".to_string()]));
    }

    #[test]
    fn shell_log_frame_has_headers_and_body() {
        let frame = ControllerFrame::ShellLog {
            headers: ShellLogHeaders {
                id: "job".into(),
                step_id: "step".into(),
            },
            body: ShellLogBody {
                id: "step".into(),
                content: "aGk=".into(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "shell-log");
        assert_eq!(value["headers"]["stepId"], "step");
        assert_eq!(value["body"]["content"], "aGk=");
    }
}
