use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{DeployError, Result, TransferErrorKind};
use crate::remote::{RemoteShell, RemoteStat, commands, parse_stat};

/// Queries size and modification time of a remote path
///
/// # Returns
///
/// `Ok(None)` when the remote path does not exist.
///
/// # Errors
///
/// Returns an error if the command cannot run, exits non-zero or prints
/// something that is neither the absent sentinel nor `"<size> <mtime>"`.
pub async fn remote_stat(shell: &dyn RemoteShell, remote_path: &str) -> Result<Option<RemoteStat>> {
    let output = shell.exec(&commands::stat(remote_path)).await?;
    if !output.success() {
        let diagnostic = output.diagnostic();
        return Err(DeployError::Transfer {
            path: remote_path.to_string(),
            kind: TransferErrorKind::classify(&diagnostic),
            detail: diagnostic,
        });
    }
    parse_stat(&output.stdout_lossy()).map_err(|detail| DeployError::Transfer {
        path: remote_path.to_string(),
        kind: TransferErrorKind::Unknown,
        detail,
    })
}

/// Incremental transfer decision for one file.
///
/// Transfers when the remote file is absent, differs in size, or is older
/// than the local file at one-second resolution.
pub fn should_transfer(local_size: u64, local_mtime: i64, remote: Option<RemoteStat>) -> bool {
    match remote {
        None => true,
        Some(remote) if remote.size != local_size => true,
        Some(remote) => local_mtime > remote.mtime,
    }
}

/// Probes the remote copy and applies [`should_transfer`].
///
/// Any probe failure means "transfer": an uncertain file is never skipped.
pub async fn needs_transfer(
    shell: &dyn RemoteShell,
    remote_path: &str,
    local_size: u64,
    local_mtime: SystemTime,
) -> bool {
    match remote_stat(shell, remote_path).await {
        Ok(remote) => {
            let transfer = should_transfer(local_size, unix_secs(local_mtime), remote);
            if !transfer {
                debug!(path = remote_path, "Remote file is up to date, skipping");
            }
            transfer
        }
        Err(e) => {
            warn!(path = remote_path, error = %e, "Remote probe failed, transferring anyway");
            true
        }
    }
}

/// Whole seconds since the Unix epoch, negative before it
pub fn unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => after.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}
