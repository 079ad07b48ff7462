//! Plugins are git repositories cloned into the plugin directory on first use
//! and fast-forwarded afterwards.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use flowci_engine::PluginFetcher;
use flowci_util::redact_sensitive;
use tokio::process::Command;
use tracing::{debug, info};

pub struct GitPluginFetcher {
    url_template: String,
}

impl GitPluginFetcher {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
        }
    }

    /// Clone URL of plugin `name`.
    pub fn repository_url(&self, name: &str) -> String {
        self.url_template.replace("{name}", name)
    }
}

#[async_trait::async_trait]
impl PluginFetcher for GitPluginFetcher {
    async fn fetch(&self, name: &str, dest: &Path) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            bail!("invalid plugin name '{name}'");
        }

        if dest.join(".git").is_dir() {
            debug!(plugin = name, dest = %dest.display(), "updating plugin");
            let mut command = Command::new("git");
            command.arg("-C").arg(dest).args(["pull", "--ff-only", "--quiet"]);
            return run_git(command).await;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("create {}", parent.display()))?;
        }
        let url = self.repository_url(name);
        info!(plugin = name, %url, "cloning plugin");
        let mut command = Command::new("git");
        command.args(["clone", "--depth", "1", "--quiet", &url]).arg(dest);
        run_git(command).await
    }
}

async fn run_git(mut command: Command) -> Result<()> {
    let output = command
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .context("run git")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git exited with {}: {}", output.status, redact_sensitive(stderr.trim()));
    }
    Ok(())
}
