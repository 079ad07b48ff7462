//! Step caches: restored into the work dir before a step, saved after it succeeded.
//!
//! Transfers always go through a host directory. The host shell works in it
//! directly; container backends copy it into and out of their work dir.

use std::path::{Component, Path, PathBuf};

use flowci_types::StepIn;
use tracing::{debug, info, trace};

use crate::controller::ControllerClient;
use crate::error::ControllerError;

/// Downloads every file of the step's cache into `work_dir`; returns how many were restored.
pub async fn restore(controller: &dyn ControllerClient, step: &StepIn, work_dir: &Path) -> Result<usize, ControllerError> {
    let Some(spec) = step.cache.as_ref() else {
        return Ok(0);
    };
    let Some(cache) = controller.cache_get(&step.job_id, &spec.key).await? else {
        debug!(key = %spec.key, "no cache stored yet");
        return Ok(0);
    };

    tokio::fs::create_dir_all(work_dir).await?;
    for name in &cache.files {
        let progress = |written: u64| trace!(name = %name, written, "cache download progress");
        let path = controller.cache_download(&cache.id, work_dir, name, &progress).await?;
        debug!(path = %path.display(), "cache file restored");
    }
    info!(key = %spec.key, files = cache.files.len(), "cache restored");
    Ok(cache.files.len())
}

/// Uploads the files under the step's cache paths; returns how many were uploaded.
pub async fn save(controller: &dyn ControllerClient, step: &StepIn, work_dir: &Path) -> Result<usize, ControllerError> {
    let Some(spec) = step.cache.as_ref() else {
        return Ok(0);
    };
    let files = collect_files(work_dir, &spec.paths).await?;
    if files.is_empty() {
        debug!(key = %spec.key, "nothing to cache");
        return Ok(0);
    }
    controller.cache_put(&step.job_id, &spec.key, work_dir, &files).await?;
    info!(key = %spec.key, files = files.len(), "cache saved");
    Ok(files.len())
}

/// Regular files under `paths` (relative to `work_dir`), directories walked recursively.
///
/// Symbolic links are skipped so a link cycle cannot trap the walk.
pub async fn collect_files(work_dir: &Path, paths: &[String]) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = paths.iter().map(|path| work_dir.join(path)).collect();
    pending.reverse();
    while let Some(path) = pending.pop() {
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };
        if metadata.file_type().is_symlink() {
            trace!(path = %path.display(), "skipping symlink");
            continue;
        }
        if metadata.is_file() {
            files.push(path);
            continue;
        }
        if metadata.is_dir() {
            let mut children = Vec::new();
            let mut entries = tokio::fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                children.push(entry.path());
            }
            children.sort();
            pending.extend(children.into_iter().rev());
        }
    }
    Ok(files)
}

/// `(path inside the container, host destination)` for each cache path.
///
/// Absolute paths and paths leaving the work dir are dropped.
pub fn export_targets(container_work_dir: &str, host_dir: &Path, paths: &[String]) -> Vec<(String, PathBuf)> {
    paths
        .iter()
        .map(|path| path.trim_end_matches('/'))
        .filter(|path| {
            let relative = Path::new(path);
            !path.is_empty() && relative.components().all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
        })
        .map(|path| (format!("{container_work_dir}/{path}"), host_dir.join(path)))
        .collect()
}

/// Whether `dir` exists and holds at least one entry.
pub async fn is_populated(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Recreates `dir` empty.
pub async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    discard(dir).await?;
    tokio::fs::create_dir_all(dir).await
}

/// Removes `dir` and everything below it; a missing dir is fine.
pub async fn discard(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(error) if error.kind() != std::io::ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
