use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{DeployError, Result};
use crate::operations::probe;
use crate::remote::RemoteShell;
use crate::types::FileTask;

/// A regular file found under the local root
#[derive(Debug, Clone)]
pub struct LocalFile {
    pub path: PathBuf,
    pub relative: PathBuf,
    pub size: u64,
    pub mod_time: SystemTime,
}

/// Walks `local_root` recursively and lists its regular files.
///
/// Entries are visited in file name order; directories are not returned.
pub fn walk_local(local_root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(local_root)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| DeployError::LocalSource(format!("cannot walk local tree: {e}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| {
            DeployError::LocalSource(format!("cannot stat {}: {e}", entry.path().display()))
        })?;
        let relative = entry
            .path()
            .strip_prefix(local_root)
            .map_err(|e| DeployError::LocalSource(format!("{}: {e}", entry.path().display())))?
            .to_path_buf();
        files.push(LocalFile {
            path: entry.path().to_path_buf(),
            relative,
            size: metadata.len(),
            mod_time: metadata.modified()?,
        });
    }
    Ok(files)
}

/// Maps a path relative to the local root onto the remote root.
///
/// The remote host is POSIX, so components are always joined with `/`
/// whatever the local separator is.
pub fn remote_path_for(remote_root: &str, relative: &Path) -> String {
    let mut remote = remote_root.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            remote.push('/');
            remote.push_str(&part.to_string_lossy());
        }
    }
    if remote.is_empty() {
        remote.push('/');
    }
    remote
}

/// Plans the transfer tasks for one run.
///
/// In full mode every local file becomes a task. In incremental mode each
/// file is probed on the remote side first and skipped when up to date.
pub async fn plan_tasks(
    shell: &dyn RemoteShell,
    local_root: &Path,
    remote_root: &str,
    incremental: bool,
) -> Result<Vec<FileTask>> {
    let root = local_root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || walk_local(&root))
        .await
        .map_err(|e| DeployError::LocalSource(format!("local walk aborted: {e}")))??;

    let scanned = files.len();
    let mut tasks = Vec::with_capacity(scanned);
    for file in files {
        let remote_path = remote_path_for(remote_root, &file.relative);
        if incremental
            && !probe::needs_transfer(shell, &remote_path, file.size, file.mod_time).await
        {
            continue;
        }
        debug!(local = %file.path.display(), remote = %remote_path, "Planned transfer");
        tasks.push(FileTask::new(
            file.path,
            remote_path,
            file.size,
            Some(file.mod_time),
        ));
    }

    info!(
        scanned,
        planned = tasks.len(),
        incremental,
        "Transfer plan ready"
    );
    Ok(tasks)
}
