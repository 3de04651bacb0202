use std::time::Instant;

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result, TransferErrorKind};
use crate::operations::probe::{self, unix_secs};
use crate::remote::{RemoteShell, commands, remote_parent};
use crate::types::FileTask;

/// What happened to one transfer task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// File written and its size verified on the remote side
    Transferred { bytes: u64 },
    /// Local source vanished after planning; nothing to transfer
    SourceMissing,
}

/// Creates `dir` and its parents on the remote host
///
/// # Errors
///
/// Returns `DeployError::Directory` with the classified remote diagnostic.
pub async fn ensure_remote_dir(shell: &dyn RemoteShell, dir: &str) -> Result<()> {
    let output = shell
        .exec(&commands::mkdir_p(dir))
        .await
        .map_err(|e| DeployError::Directory {
            path: dir.to_string(),
            message: e.to_string(),
        })?;
    if output.success() {
        return Ok(());
    }
    let diagnostic = output.diagnostic();
    Err(DeployError::Directory {
        path: dir.to_string(),
        message: format!("{} ({diagnostic})", TransferErrorKind::classify(&diagnostic)),
    })
}

/// Uploads one local file to the remote server
///
/// 1. Creates the remote parent directory
/// 2. Streams the local file into `cat > path` in `io_size` chunks
/// 3. Classifies a non-zero exit from the remote stderr
/// 4. Verifies the remote file exists and its size matches the bytes sent
/// 5. Restores the local modification time, best-effort
///
/// A transfer is never interrupted once started.
///
/// # Errors
///
/// Returns an error if:
/// - The remote parent directory cannot be created
/// - The local file cannot be read
/// - The remote write fails, classified by `TransferErrorKind`
/// - The remote file is missing or its size differs after the write
/// - The session drops during any remote call, as a `ConnectionIssue`
pub async fn put(shell: &dyn RemoteShell, task: &FileTask, io_size: usize) -> Result<UploadOutcome> {
    let upload_time = Instant::now();
    let mut local_file = match fs::File::open(&task.local_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(local = %task.local_path.display(), "Local file no longer exists, dropping task");
            return Ok(UploadOutcome::SourceMissing);
        }
        Err(e) => return Err(DeployError::Io(e)),
    };
    let metadata = local_file.metadata().await?;
    let expected_size = metadata.len();
    debug!(local = %task.local_path.display(), size = expected_size, "Local file opened");

    if let Some(parent) = remote_parent(&task.remote_path) {
        ensure_remote_dir(shell, parent)
            .await
            .map_err(|e| connection_issue(&task.remote_path, e))?;
    }

    let output = shell
        .exec_with_input(
            &commands::write_file(&task.remote_path),
            &mut local_file,
            io_size,
        )
        .await
        .map_err(|e| connection_issue(&task.remote_path, e))?;
    if !output.success() {
        let diagnostic = output.diagnostic();
        return Err(DeployError::Transfer {
            path: task.remote_path.clone(),
            kind: TransferErrorKind::classify(&diagnostic),
            detail: diagnostic,
        });
    }

    let remote = probe::remote_stat(shell, &task.remote_path)
        .await
        .map_err(|e| connection_issue(&task.remote_path, e))?;
    let Some(remote) = remote else {
        return Err(DeployError::Transfer {
            path: task.remote_path.clone(),
            kind: TransferErrorKind::Unknown,
            detail: "remote file missing after write".to_string(),
        });
    };
    if remote.size != expected_size {
        return Err(DeployError::Verification {
            path: task.remote_path.clone(),
            expected: expected_size,
            actual: remote.size,
        });
    }

    if let Ok(modified) = metadata.modified() {
        restore_mtime(shell, &task.remote_path, unix_secs(modified)).await;
    }

    info!(
        "File {:?} uploaded. Time taken {:?}",
        task.remote_path,
        upload_time.elapsed(),
    );
    Ok(UploadOutcome::Transferred {
        bytes: expected_size,
    })
}

/// A dropped session during a per-file call is a transfer failure of that
/// file, retried like any other
fn connection_issue(remote_path: &str, err: DeployError) -> DeployError {
    match err {
        DeployError::Connection(detail) => DeployError::Transfer {
            path: remote_path.to_string(),
            kind: TransferErrorKind::ConnectionIssue,
            detail,
        },
        other => other,
    }
}

async fn restore_mtime(shell: &dyn RemoteShell, remote_path: &str, epoch_secs: i64) {
    match shell.exec(&commands::set_mtime(remote_path, epoch_secs)).await {
        Ok(output) if output.success() => {}
        Ok(output) => warn!(
            path = remote_path,
            diagnostic = %output.diagnostic(),
            "Could not restore modification time"
        ),
        Err(e) => warn!(path = remote_path, error = %e, "Could not restore modification time"),
    }
}
