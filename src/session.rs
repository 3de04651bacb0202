use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::remote::native::NativeShell;
use crate::remote::system::SystemShell;
use crate::remote::{RemoteShell, commands};
use crate::types::{AuthMethod, ServerProfile, SshBackend};

const CONNECTION_TEST_MARKER: &str = "sitepush-connection-ok";

/// Manager for the one SSH connection a deployment run uses
#[derive(Default)]
pub struct SshSessionManager {
    shell: Option<Arc<dyn RemoteShell>>,
}

impl std::fmt::Debug for SshSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSessionManager")
            .field("connected", &self.shell.is_some())
            .finish()
    }
}

impl SshSessionManager {
    /// Establishes a new SSH connection to the host of `profile`
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Config` for an incomplete profile and
    /// `DeployError::Connection` when dialing, the handshake or authentication
    /// fails or exceeds `config.connect_timeout()`. Nothing is retried.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let profile = ServerProfile::with_key("example.com", "deploy", "/home/me/.ssh/id_ed25519", "/var/www");
    /// let manager = SshSessionManager::connect(&profile, &DeployConfig::default()).await?;
    /// ```
    pub async fn connect(profile: &ServerProfile, config: &DeployConfig) -> Result<Self> {
        let (auth, backend) = profile.validate()?;
        let shell: Arc<dyn RemoteShell> = match (backend, &auth) {
            (SshBackend::System, AuthMethod::PrivateKey(key_path)) => Arc::new(
                SystemShell::connect(
                    profile,
                    key_path,
                    &config.control_dir,
                    config.connect_timeout(),
                )
                .await?,
            ),
            (SshBackend::System, AuthMethod::Password(_)) => {
                return Err(DeployError::Config(
                    "the system ssh backend cannot authenticate with a password".to_string(),
                ));
            }
            _ => Arc::new(NativeShell::connect(profile, &auth, config.connect_timeout()).await?),
        };
        info!(host = %profile.host, ?backend, "SSH connection established");
        Ok(Self::from_shell(shell))
    }

    /// Wraps an already connected shell
    pub fn from_shell(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell: Some(shell) }
    }

    /// Hands out the shared connection; each command on it opens its own session
    pub fn shell(&self) -> Result<Arc<dyn RemoteShell>> {
        debug!("Handing out shared ssh connection");
        self.shell
            .clone()
            .ok_or_else(|| DeployError::Connection("SSH session not connected".to_string()))
    }

    /// Runs a trivial command and checks its output
    pub async fn test_connection(&self) -> Result<()> {
        let shell = self.shell()?;
        let output = shell.exec(&commands::echo(CONNECTION_TEST_MARKER)).await?;
        if !output.success() {
            return Err(DeployError::Connection(format!(
                "test command failed: {}",
                output.diagnostic()
            )));
        }
        if !output.stdout_lossy().contains(CONNECTION_TEST_MARKER) {
            return Err(DeployError::Connection(
                "test command returned unexpected output".to_string(),
            ));
        }
        Ok(())
    }

    /// Closes the connection once nobody else holds it
    ///
    /// # Note
    ///
    /// Fails without closing while a transfer still holds a handle to the
    /// connection.
    pub async fn close(&mut self) -> Result<()> {
        match self.shell.take() {
            Some(shell) if Arc::strong_count(&shell) == 1 => {
                info!("No transfer is using the connection anymore so closing it");
                shell.close().await
            }
            Some(shell) => {
                error!("Connection still in use, not closing it");
                self.shell = Some(shell);
                Err(DeployError::Connection(
                    "failed to close ssh session: still in use".to_string(),
                ))
            }
            None => {
                error!("Session not found");
                Err(DeployError::Connection(
                    "failed to close ssh session: not connected".to_string(),
                ))
            }
        }
    }

    /// Checks if the connection is still active, forgetting it if not
    pub async fn connected(&mut self) -> bool {
        match self.shell.as_ref() {
            Some(shell) => {
                if shell.check().await.is_ok() {
                    true
                } else {
                    warn!("Underlying ssh session is dead so setting status to disconnected");
                    self.shell = None;
                    false
                }
            }
            None => false,
        }
    }
}

/// Opens connections for the engine.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, profile: &ServerProfile, config: &DeployConfig)
    -> Result<SshSessionManager>;
}

/// Connector dialing real SSH servers
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn open(
        &self,
        profile: &ServerProfile,
        config: &DeployConfig,
    ) -> Result<SshSessionManager> {
        SshSessionManager::connect(profile, config).await
    }
}
