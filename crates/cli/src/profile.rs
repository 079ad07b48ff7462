//! Host resource sampling and the periodic profile reporter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flowci_engine::ControllerClient;
use flowci_types::Resource;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MEMINFO: &str = "/proc/meminfo";

/// Snapshot of cpu, memory and disk of the host; memory and disk in megabytes.
pub fn sample(workspace: &Path) -> Resource {
    let (total_memory, free_memory) = std::fs::read_to_string(MEMINFO).map(|content| parse_meminfo(&content)).unwrap_or((0, 0));
    let (total_disk, free_disk) = disk_usage(workspace);
    Resource {
        cpu: u32::try_from(num_cpus::get()).unwrap_or(u32::MAX),
        total_memory,
        free_memory,
        total_disk,
        free_disk,
    }
}

/// `(MemTotal, MemAvailable)` in megabytes; `MemFree` when `MemAvailable` is missing.
pub fn parse_meminfo(content: &str) -> (u64, u64) {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            rest.split_whitespace().next()?.parse::<u64>().ok()
        })
    };
    let total = field("MemTotal").unwrap_or(0);
    let free = field("MemAvailable").or_else(|| field("MemFree")).unwrap_or(0);
    (total / 1024, free / 1024)
}

#[cfg(unix)]
fn disk_usage(path: &Path) -> (u64, u64) {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            let total = stat.blocks() as u64 * fragment;
            let free = stat.blocks_available() as u64 * fragment;
            (total / (1024 * 1024), free / (1024 * 1024))
        }
        Err(error) => {
            debug!(path = %path.display(), error = %error, "statvfs failed");
            (0, 0)
        }
    }
}

#[cfg(not(unix))]
fn disk_usage(_path: &Path) -> (u64, u64) {
    (0, 0)
}

/// Reports a fresh sample every `interval` until `shutdown` is cancelled.
pub fn spawn_reporter(
    controller: Arc<dyn ControllerClient>,
    workspace: PathBuf,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => break,
            }
            let workspace = workspace.clone();
            let resource = match tokio::task::spawn_blocking(move || sample(&workspace)).await {
                Ok(resource) => resource,
                Err(error) => {
                    warn!(error = %error, "resource sampling failed");
                    continue;
                }
            };
            if let Err(error) = controller.report_profile(&resource).await {
                warn!(error = %error, "failed to report resource profile");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_prefers_available_memory() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_meminfo(content), (16000, 8000));
        assert_eq!(parse_meminfo("MemTotal: 2048 kB\nMemFree: 1024 kB\n"), (2, 1));
        assert_eq!(parse_meminfo(""), (0, 0));
    }

    #[test]
    fn sample_reports_cpus() {
        let dir = tempfile::tempdir().unwrap();
        let resource = sample(dir.path());
        assert!(resource.cpu >= 1);
        #[cfg(unix)]
        assert!(resource.total_disk >= resource.free_disk);
    }
}
