//! Remote command execution over one SSH connection.
//!
//! Every remote operation the engine needs is a POSIX shell command run in
//! its own SSH session. Paths are always shell-escaped before they are
//! interpolated into a command line.

use std::borrow::Cow;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Backend driving the system `ssh` binary
pub(crate) mod system;

/// In-process SSH backend
pub(crate) mod native;

/// Printed by the probe command when the remote path does not exist
pub const ABSENT_SENTINEL: &str = "NOTEXIST";

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the session closed without reporting a status
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }

    /// Human readable reason for a failed command
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr_lossy();
        let stderr = stderr.trim();
        match (self.exit_status, stderr.is_empty()) {
            (Some(code), false) => format!("exit status {code}: {stderr}"),
            (Some(code), true) => format!("exit status {code}"),
            (None, false) => format!("no exit status: {stderr}"),
            (None, true) => "session closed without exit status".to_string(),
        }
    }
}

/// One authenticated SSH connection able to run shell commands.
///
/// Each call opens a fresh session multiplexed over the shared connection;
/// sessions are never pooled.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` with empty input and collects its output
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Runs `command`, streams `input` into its stdin in `io_size` chunks and
    /// closes stdin to signal end of data
    async fn exec_with_input(
        &self,
        command: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        io_size: usize,
    ) -> Result<CommandOutput>;

    /// Checks the underlying connection is still alive
    async fn check(&self) -> Result<()>;

    /// Tears the connection down
    async fn close(&self) -> Result<()>;
}

/// Size and modification time of a remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: i64,
}

/// Builders for the remote command lines.
pub mod commands {
    use super::*;

    /// Quotes `path` for a POSIX shell
    pub fn escape(path: &str) -> Cow<'_, str> {
        shell_escape::unix::escape(Cow::Borrowed(path))
    }

    pub fn mkdir_p(dir: &str) -> String {
        format!("mkdir -p -- {}", escape(dir))
    }

    pub fn stat(path: &str) -> String {
        format!(
            "stat -c '%s %Y' -- {} 2>/dev/null || echo {}",
            escape(path),
            ABSENT_SENTINEL
        )
    }

    pub fn write_file(path: &str) -> String {
        format!("cat > {}", escape(path))
    }

    pub fn set_mtime(path: &str, epoch_secs: i64) -> String {
        format!("touch -c -m -d @{} -- {}", epoch_secs, escape(path))
    }

    pub fn echo(marker: &str) -> String {
        format!("echo {}", escape(marker))
    }
}

/// Parses the output of [`commands::stat`].
///
/// Returns `Ok(None)` for the absent sentinel and `Err` with the raw text for
/// anything that is not `"<size> <mtime>"`.
pub fn parse_stat(output: &str) -> std::result::Result<Option<RemoteStat>, String> {
    let trimmed = output.trim();
    if trimmed == ABSENT_SENTINEL {
        return Ok(None);
    }
    let mut parts = trimmed.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(size), Some(mtime), None) => {
            let size = size
                .parse::<u64>()
                .map_err(|_| format!("invalid size in stat output: {trimmed:?}"))?;
            let mtime = mtime
                .parse::<i64>()
                .map_err(|_| format!("invalid mtime in stat output: {trimmed:?}"))?;
            Ok(Some(RemoteStat { size, mtime }))
        }
        _ => Err(format!("unexpected stat output: {trimmed:?}")),
    }
}

/// Parent directory of a POSIX remote path, `None` for top-level entries
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}
