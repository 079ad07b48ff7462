//! Shell payloads shared by the container backends.

use flowci_types::DataVolumeSpec;

use crate::bins::BINARIES;

pub(crate) const SHELL_PID_FILE: &str = "/tmp/.shell.pid";
pub(crate) const TTY_PID_FILE: &str = "/tmp/.tty.pid";
pub(crate) const ENV_FILE: &str = "/tmp/.env";
pub(crate) const CONTAINER_BIN_DIR: &str = "/ws/bin";

/// Full stdin payload for the runtime shell of a container step.
///
/// `exports` are emitted before the binaries are injected, data-volume setup
/// scripts are sourced right before the user lines.
pub(crate) fn container_script(exports: &[(String, String)], volumes: &[DataVolumeSpec], scripts: &[String]) -> String {
    let mut lines = vec![
        format!("echo $$ > {SHELL_PID_FILE}"),
        "set -e".to_string(),
        format!("rm -f {ENV_FILE}"),
    ];
    lines.extend(exports.iter().map(|(key, value)| format!("export {key}='{value}'")));
    lines.push(format!("mkdir -p {CONTAINER_BIN_DIR}"));
    lines.push(format!("export PATH={CONTAINER_BIN_DIR}:$PATH"));
    for asset in BINARIES {
        lines.extend(asset.injection_script(CONTAINER_BIN_DIR));
    }
    for path in volumes.iter().filter_map(DataVolumeSpec::setup_script_path) {
        lines.push(format!("if [ -f \"{path}\" ]; then source \"{path}\"; fi"));
    }
    lines.extend(scripts.iter().cloned());
    lines.push(format!("env > {ENV_FILE}"));
    lines.push("exit 0".to_string());

    let mut script = lines.join("\n");
    script.push('\n');
    script
}

/// First line written to an interactive shell.
pub(crate) fn tty_preamble() -> String {
    format!("echo $$ > {TTY_PID_FILE}\n")
}

/// `sh -c` command that kills the processes recorded in `pid_files`.
pub(crate) fn kill_command(pid_files: &[&str]) -> Vec<String> {
    let kills: Vec<String> = pid_files
        .iter()
        .map(|file| format!("[ -f {file} ] && kill -9 $(cat {file}) 2>/dev/null"))
        .collect();
    vec!["/bin/sh".to_string(), "-c".to_string(), format!("{}; true", kills.join("; "))]
}
