use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::remote::{CommandOutput, RemoteShell};
use crate::types::{HostKeyPolicy, ServerProfile};

/// Connection through the system `ssh` binary.
///
/// A control master is started in `control_dir` and every command runs as a
/// separate multiplexed session on it.
#[derive(Debug)]
pub(crate) struct SystemShell {
    session: RwLock<Option<Session>>,
}

impl SystemShell {
    pub(crate) async fn connect(
        profile: &ServerProfile,
        key_path: &Path,
        control_dir: &Path,
        connect_timeout: Duration,
    ) -> Result<Self> {
        info!(
            "Connecting to {}@{} with the system ssh client",
            profile.username,
            profile.address()
        );
        let known_hosts = match profile.host_key_policy {
            HostKeyPolicy::Strict => KnownHosts::Strict,
            HostKeyPolicy::AcceptAny => {
                warn!(host = %profile.host, "Host key verification disabled for this profile");
                KnownHosts::Accept
            }
        };

        let mut builder = SessionBuilder::default();
        builder
            .user(profile.username.clone())
            .port(profile.port)
            .keyfile(key_path)
            .control_directory(control_dir)
            .known_hosts_check(known_hosts)
            .connect_timeout(connect_timeout);
        let connecting = builder.connect(&profile.host);

        // ssh enforces the connect timeout on the dial only, the outer bound
        // also covers the handshake
        let session = tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                DeployError::Connection(format!(
                    "timed out after {connect_timeout:?} connecting to {}",
                    profile.address()
                ))
            })?
            .map_err(|e| {
                DeployError::Connection(format!("cannot connect to {}: {e}", profile.address()))
            })?;

        debug!("system ssh session established");
        Ok(Self {
            session: RwLock::new(Some(session)),
        })
    }
}

fn session_closed() -> DeployError {
    DeployError::Connection("ssh session already closed".to_string())
}

#[async_trait]
impl RemoteShell for SystemShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(session_closed)?;
        debug!(command, "running remote command");
        let output = session
            .raw_command(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::Connection(format!("remote command failed to run: {e}")))?;
        Ok(CommandOutput {
            exit_status: output.status.code().map(|code| code as u32),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn exec_with_input(
        &self,
        command: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        io_size: usize,
    ) -> Result<CommandOutput> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(session_closed)?;
        debug!(command, "running remote command with input");
        let mut child = session
            .raw_command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|e| DeployError::Connection(format!("cannot open ssh session: {e}")))?;

        let mut stdin = child
            .stdin()
            .take()
            .ok_or_else(|| DeployError::Connection("remote stdin unavailable".to_string()))?;

        // A failed write is reported together with the remote stderr below,
        // which usually explains why the pipe broke
        let mut write_error = None;
        let mut buffer = BytesMut::with_capacity(io_size.max(1));
        loop {
            buffer.clear();
            match input.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(_) => {
                    if let Err(e) = stdin.write_all(&buffer).await {
                        write_error = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    drop(stdin);
                    let _ = child.disconnect().await;
                    return Err(DeployError::Io(e));
                }
            }
        }
        if write_error.is_none() {
            if let Err(e) = stdin.shutdown().await {
                write_error = Some(e);
            }
        }
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DeployError::Connection(format!("remote command failed: {e}")))?;
        let mut output = CommandOutput {
            exit_status: output.status.code().map(|code| code as u32),
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if let Some(e) = write_error {
            warn!(command, error = %e, "writing to remote stdin failed");
            if output.success() {
                output.exit_status = None;
            }
            output
                .stderr
                .extend_from_slice(format!("\nwrite to remote stdin failed: {e}").as_bytes());
        }
        Ok(output)
    }

    async fn check(&self) -> Result<()> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or_else(session_closed)?;
        session
            .check()
            .await
            .map_err(|e| DeployError::Connection(format!("ssh session is dead: {e}")))
    }

    async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.write().await.take() {
            info!("Closing system ssh session");
            session
                .close()
                .await
                .map_err(|e| DeployError::Connection(format!("failed to close ssh session: {e}")))?;
        }
        Ok(())
    }
}
