//! Host shell backend: bash on Unix, PowerShell on Windows.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use flowci_types::{LogKind, VariableStore};
use flowci_util::parse_windows_env;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bins;
use crate::error::ExecutorError;
use crate::executor::{Backend, BackendKind, StepRuntime, TtySession};
use crate::logging::LogMultiplexer;

/// How long output readers may drain after the shell exits.
pub(super) const READER_GRACE: Duration = Duration::from_secs(5);

#[cfg(windows)]
const NEWLINE: &str = "\r\n";
#[cfg(not(windows))]
const NEWLINE: &str = "\n";

/// Shell flavour used to run scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    PowerShell,
}

impl ShellKind {
    /// PowerShell on Windows hosts, bash everywhere else.
    pub fn host_default() -> Self {
        if cfg!(windows) { Self::PowerShell } else { Self::Bash }
    }

    fn program(&self) -> &'static str {
        match self {
            Self::Bash => "/bin/bash",
            Self::PowerShell => "powershell.exe",
        }
    }

    fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Bash => &[],
            Self::PowerShell => &["-NoLogo", "-NoProfile", "-NonInteractive", "-Command", "-"],
        }
    }
}

/// Runs steps as a child shell on the host.
#[derive(Debug)]
pub struct ShellBackend {
    shell: ShellKind,
    env_file: Mutex<Option<PathBuf>>,
}

impl ShellBackend {
    pub fn new(shell: ShellKind) -> Self {
        Self {
            shell,
            env_file: Mutex::new(None),
        }
    }

    fn work_dir(&self, runtime: &StepRuntime) -> PathBuf {
        runtime.context().flow_dir(&runtime.step().flow_id)
    }

    /// Full stdin payload for one attempt.
    fn script(&self, runtime: &StepRuntime, env_file: Option<&PathBuf>) -> String {
        let bin_dir = runtime.context().bin_dir.display().to_string();
        let mut lines = Vec::with_capacity(runtime.step().scripts.len() + 4);
        match self.shell {
            ShellKind::Bash => {
                lines.push("set -e".to_string());
                lines.push(format!("export PATH=\"{bin_dir}:$PATH\""));
                lines.extend(runtime.step().scripts.iter().cloned());
                lines.push(format!("echo {}", runtime.sentinel()));
                lines.push("env".to_string());
            }
            ShellKind::PowerShell => {
                lines.push("$ErrorActionPreference = \"Stop\"".to_string());
                lines.push(format!("$env:PATH = \"{bin_dir};\" + $env:PATH"));
                lines.extend(runtime.step().scripts.iter().cloned());
                if let Some(env_file) = env_file {
                    lines.push(format!(
                        "Get-ChildItem env: | Out-File -FilePath '{}' -Encoding BigEndianUnicode -Width 8192",
                        env_file.display()
                    ));
                }
            }
        }
        let mut script = lines.join(NEWLINE);
        script.push_str(NEWLINE);
        script
    }

    fn command(&self, runtime: &StepRuntime) -> Command {
        let mut command = Command::new(self.shell.program());
        command
            .args(self.shell.args())
            .current_dir(self.work_dir(runtime))
            .envs(runtime.variables().iter())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Backend for ShellBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shell
    }

    fn script_paths(&self, runtime: &StepRuntime) -> (String, String, String) {
        let context = runtime.context();
        (
            context.workspace.display().to_string(),
            self.work_dir(runtime).display().to_string(),
            context.plugin_dir.display().to_string(),
        )
    }

    fn cache_dir(&self, runtime: &StepRuntime) -> PathBuf {
        self.work_dir(runtime)
    }

    async fn init(&self, runtime: &StepRuntime) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(self.work_dir(runtime)).await?;
        bins::install_all(&runtime.context().bin_dir).await?;
        Ok(())
    }

    async fn run(&self, runtime: &StepRuntime) -> Result<i32, ExecutorError> {
        let env_file = (self.shell == ShellKind::PowerShell)
            .then(|| std::env::temp_dir().join(format!("flowci-{}.env", Uuid::new_v4().simple())));
        *self.env_file.lock().expect("env file lock") = env_file.clone();

        let mut command = self.command(runtime);
        command.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .map_err(|error| ExecutorError::backend(format!("failed to start {}: {error}", self.shell.program())))?;
        let pid = child.id();
        runtime.set_process_id(pid);
        debug!(pid = ?pid, "shell started");

        let script = self.script(runtime, env_file.as_ref());
        let stdin = child.stdin.take().ok_or_else(|| ExecutorError::backend("shell stdin unavailable"))?;
        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            if let Err(error) = stdin.write_all(script.as_bytes()).await {
                debug!(error = %error, "shell closed stdin before the script was fully written");
            }
        });
        let stdout = child.stdout.take().ok_or_else(|| ExecutorError::backend("shell stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| ExecutorError::backend("shell stderr unavailable"))?;
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
        writer.abort();
        drain_readers(readers).await;
        let status = status?;
        debug!(status = %status, "shell exited");
        Ok(exit_code(status))
    }

    async fn collect_env(&self, runtime: &StepRuntime) -> Result<VariableStore, ExecutorError> {
        match self.shell {
            ShellKind::Bash => Ok(runtime.log().take_captured().await),
            ShellKind::PowerShell => {
                let env_file = self.env_file.lock().expect("env file lock").clone();
                let Some(env_file) = env_file else {
                    return Ok(VariableStore::new());
                };
                let bytes = tokio::fs::read(&env_file).await?;
                Ok(parse_windows_env(&bytes))
            }
        }
    }

    #[cfg(unix)]
    async fn open_tty(&self, runtime: &StepRuntime, session: TtySession) -> Result<(), ExecutorError> {
        if self.shell != ShellKind::Bash {
            return Err(ExecutorError::unsupported("tty"));
        }
        let mut command = self.command(runtime);
        command.arg("-i").env("TERM", "xterm");
        super::pty::run_session(command, session, None).await
    }

    #[cfg(not(unix))]
    async fn open_tty(&self, _runtime: &StepRuntime, _session: TtySession) -> Result<(), ExecutorError> {
        Err(ExecutorError::unsupported("tty"))
    }

    async fn cleanup(&self, _runtime: &StepRuntime) {
        let env_file = self.env_file.lock().expect("env file lock").take();
        if let Some(env_file) = env_file {
            if let Err(error) = tokio::fs::remove_file(&env_file).await {
                debug!(error = %error, path = %env_file.display(), "env file not removed");
            }
        }
    }
}

pub(super) fn spawn_line_reader<R>(reader: R, kind: LogKind, log: std::sync::Arc<LogMultiplexer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(error) = log.write_line(kind, &line).await {
                        warn!(error = %error, "failed to write step output");
                    }
                }
                Err(error) => {
                    debug!(error = %error, "output stream closed");
                    break;
                }
            }
        }
    })
}

pub(super) async fn drain_readers(readers: [JoinHandle<()>; 2]) {
    for reader in readers {
        let abort = reader.abort_handle();
        if tokio::time::timeout(READER_GRACE, reader).await.is_err() {
            warn!("output reader still busy; detaching it");
            abort.abort();
        }
    }
}

pub(super) async fn kill_process_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = pid
            && let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL)
        {
            debug!(error = %error, pid, "failed to kill process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(error) = child.kill().await {
        debug!(error = %error, "failed to kill shell");
    }
}

pub(super) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    flowci_types::exit_code::UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flowci_types::StepIn;

    use crate::context::AgentContext;

    async fn runtime(scripts: Vec<&str>) -> (tempfile::TempDir, StepRuntime) {
        let dir = tempfile::tempdir().unwrap();
        let context = Arc::new(AgentContext::new("agent", dir.path()));
        let log = Arc::new(LogMultiplexer::open("s1", &context.logging_dir, false, None).await.unwrap());
        let step = StepIn::new("s1", scripts.into_iter().map(String::from).collect());
        (dir, StepRuntime::new(step, context, log))
    }

    #[tokio::test]
    async fn bash_script_wraps_user_lines() {
        let (_dir, runtime) = runtime(vec!["echo a", "echo b"]).await;
        let backend = ShellBackend::new(ShellKind::Bash);
        let script = backend.script(&runtime, None);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "set -e");
        assert!(lines[1].starts_with("export PATH="));
        assert_eq!(&lines[2..4], &["echo a", "echo b"]);
        assert_eq!(lines[4], format!("echo {}", runtime.sentinel()));
        assert_eq!(lines[5], "env");
    }

    #[tokio::test]
    async fn powershell_script_dumps_env_to_file() {
        let (_dir, runtime) = runtime(vec!["Write-Host hi"]).await;
        let backend = ShellBackend::new(ShellKind::PowerShell);
        let env_file = PathBuf::from("C:\\tmp\\x.env");
        let script = backend.script(&runtime, Some(&env_file));
        assert!(script.contains("$ErrorActionPreference = \"Stop\""));
        assert!(script.contains("Out-File -FilePath 'C:\\tmp\\x.env' -Encoding BigEndianUnicode"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_bash_and_captures_env() {
        let (_dir, runtime) = runtime(vec!["echo hello", "export FLOW_X=1"]).await;
        let backend = ShellBackend::new(ShellKind::Bash);
        backend.init(&runtime).await.unwrap();
        runtime.begin_attempt().await;
        let code = backend.run(&runtime).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(runtime.log().line_count().await, 1);
        let env = backend.collect_env(&runtime).await.unwrap();
        assert_eq!(env.get("FLOW_X"), Some("1"));
        assert!(runtime.result().process_id.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_without_trailing_newline_keeps_env_capture() {
        let (_dir, runtime) = runtime(vec!["export FLOW_A=1", "printf abc"]).await;
        let backend = ShellBackend::new(ShellKind::Bash);
        backend.init(&runtime).await.unwrap();
        runtime.begin_attempt().await;
        assert_eq!(backend.run(&runtime).await.unwrap(), 0);
        assert_eq!(runtime.log().line_count().await, 1);
        let env = backend.collect_env(&runtime).await.unwrap();
        assert_eq!(env.get("FLOW_A"), Some("1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn signal_exit_codes_are_offset() {
        let (_dir, runtime) = runtime(vec!["kill -9 $$"]).await;
        let backend = ShellBackend::new(ShellKind::Bash);
        backend.init(&runtime).await.unwrap();
        runtime.begin_attempt().await;
        assert_eq!(backend.run(&runtime).await.unwrap(), 137);
    }
}
