use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::remote::{CommandOutput, RemoteShell};
use crate::types::{AuthMethod, HostKeyPolicy, ServerProfile};

/// Host key handler for the in-process client.
struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(host = %self.host, "Skipping SSH host key verification (insecure)");
                Ok(true)
            }
            HostKeyPolicy::Strict => {
                match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, "Host key not found in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, error = %e, "Host key rejected");
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// In-process SSH connection; every command opens its own channel.
pub(crate) struct NativeShell {
    handle: client::Handle<HostKeyCheck>,
}

impl NativeShell {
    pub(crate) async fn connect(
        profile: &ServerProfile,
        auth: &AuthMethod,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let addr = profile.address();
        info!(addr = %addr, user = %profile.username, "Connecting with the native ssh client");

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: profile.host.clone(),
            port: profile.port,
            policy: profile.host_key_policy,
        };

        let handshake = async {
            let mut handle = client::connect(config, addr.as_str(), handler)
                .await
                .map_err(|e| DeployError::Connection(format!("SSH handshake with {addr} failed: {e}")))?;
            let authenticated = match auth {
                AuthMethod::Password(password) => handle
                    .authenticate_password(profile.username.clone(), password.clone())
                    .await
                    .map_err(|e| DeployError::Connection(format!("password auth failed: {e}")))?,
                AuthMethod::PrivateKey(path) => {
                    let key_pair = russh_keys::load_secret_key(path, None).map_err(|e| {
                        DeployError::Connection(format!(
                            "cannot load private key {}: {e}",
                            path.display()
                        ))
                    })?;
                    handle
                        .authenticate_publickey(profile.username.clone(), Arc::new(key_pair))
                        .await
                        .map_err(|e| DeployError::Connection(format!("public key auth failed: {e}")))?
                }
            };
            if !authenticated {
                return Err(DeployError::Connection(format!(
                    "authentication rejected for {}@{addr}",
                    profile.username
                )));
            }
            Ok::<_, DeployError>(handle)
        };

        let handle = tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| {
                DeployError::Connection(format!(
                    "timed out after {connect_timeout:?} connecting to {}",
                    profile.address()
                ))
            })??;

        debug!("native ssh session authenticated");
        Ok(Self { handle })
    }

    async fn run(
        &self,
        command: &str,
        input: Option<&mut (dyn AsyncRead + Send + Unpin)>,
    ) -> Result<CommandOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| DeployError::Connection(format!("cannot open ssh session: {e}")))?;
        debug!(command, "running remote command");
        channel
            .exec(true, command)
            .await
            .map_err(|e| DeployError::Connection(format!("cannot start remote command: {e}")))?;

        let mut write_error = None;
        if let Some(input) = input {
            if let Err(e) = channel.data(input).await {
                write_error = Some(e);
            }
        }
        if let Err(e) = channel.eof().await {
            write_error.get_or_insert(e);
        }

        let mut output = CommandOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

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
}

#[async_trait]
impl RemoteShell for NativeShell {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.run(command, None).await
    }

    async fn exec_with_input(
        &self,
        command: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        _io_size: usize,
    ) -> Result<CommandOutput> {
        // russh splits the stream into packets sized by the channel window
        self.run(command, Some(input)).await
    }

    async fn check(&self) -> Result<()> {
        if self.handle.is_closed() {
            Err(DeployError::Connection("ssh session is dead".to_string()))
        } else {
            Ok(())
        }
    }

    async fn close(&self) -> Result<()> {
        if self.handle.is_closed() {
            return Ok(());
        }
        info!("Closing native ssh session");
        self.handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await
            .map_err(|e| DeployError::Connection(format!("failed to close ssh session: {e}")))
    }
}
