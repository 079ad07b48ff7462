//! Helper executables shipped inside the agent binary.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// An embedded executable with its POSIX mode.
#[derive(Debug, Clone, Copy)]
pub struct BinaryAsset {
    pub name: &'static str,
    pub content: &'static [u8],
    pub mode: u32,
}

/// All embedded executables.
pub const BINARIES: &[BinaryAsset] = &[BinaryAsset {
    name: "wait-for-it.sh",
    content: include_bytes!("../assets/wait-for-it.sh"),
    mode: 0o555,
}];

impl BinaryAsset {
    /// Writes the asset into `dir`, replacing a previous copy.
    pub async fn install(&self, dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(self.name);
        if tokio::fs::try_exists(&path).await? {
            // a read-only previous copy cannot be truncated in place
            tokio::fs::remove_file(&path).await?;
        }
        tokio::fs::write(&path, self.content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(self.mode)).await?;
        }
        Ok(())
    }

    /// Shell lines that recreate the asset under `dir` inside a container.
    pub fn injection_script(&self, dir: &str) -> Vec<String> {
        let target = format!("{dir}/{}", self.name);
        vec![
            format!("rm -f {target}"),
            format!("echo '{}' | base64 -d > {target}", STANDARD.encode(self.content)),
            format!("chmod {:o} {target}", self.mode),
        ]
    }
}

/// Installs every embedded executable into `dir`.
pub async fn install_all(dir: &Path) -> std::io::Result<()> {
    for asset in BINARIES {
        asset.install(dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn installs_with_mode_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        install_all(dir.path()).await.unwrap();
        install_all(dir.path()).await.unwrap();

        let path = dir.path().join("wait-for-it.sh");
        let content = std::fs::read(&path).unwrap();
        assert!(content.starts_with(b"#!/usr/bin/env bash"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(std::fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o555);
        }
    }

    #[test]
    fn injection_decodes_into_bin_dir() {
        let lines = BINARIES[0].injection_script("/ws/bin");
        assert_eq!(lines[0], "rm -f /ws/bin/wait-for-it.sh");
        assert!(lines[1].ends_with("| base64 -d > /ws/bin/wait-for-it.sh"));
        assert_eq!(lines[2], "chmod 555 /ws/bin/wait-for-it.sh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn injection_can_run_twice_under_errexit() {
        let dir = tempfile::tempdir().unwrap();
        let bin_dir = dir.path().to_string_lossy().to_string();
        let mut lines = vec!["set -e".to_string()];
        lines.extend(BINARIES[0].injection_script(&bin_dir));
        lines.extend(BINARIES[0].injection_script(&bin_dir));

        let status = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(lines.join("\n"))
            .status()
            .await
            .unwrap();
        assert!(status.success());
        let content = std::fs::read(dir.path().join("wait-for-it.sh")).unwrap();
        assert_eq!(content, BINARIES[0].content);
    }
}
