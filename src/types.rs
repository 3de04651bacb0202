use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

/// How the remote host key is treated during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Host must already be present in `~/.ssh/known_hosts`
    #[default]
    Strict,
    /// Accept any host key. Insecure, must be chosen explicitly.
    AcceptAny,
}

/// Which SSH implementation carries the connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshBackend {
    /// System backend for key auth, native backend for password auth
    #[default]
    Auto,
    /// The system `ssh` binary through a multiplexed control master
    System,
    /// In-process SSH client
    Native,
}

/// Resolved authentication method of a profile
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    PrivateKey(PathBuf),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

fn default_port() -> u16 {
    22
}

/// Connection details of one deployment target
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ServerProfile {
    /// Identifier used to tag progress events when deploying to several servers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    pub remote_path: String,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default)]
    pub backend: SshBackend,
}

impl fmt::Debug for ServerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("remote_path", &self.remote_path)
            .field("host_key_policy", &self.host_key_policy)
            .field("backend", &self.backend)
            .finish()
    }
}

impl ServerProfile {
    /// Profile authenticating with a password
    pub fn with_password(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            password: Some(password.into()),
            remote_path: remote_path.into(),
            ..Default::default()
        }
    }

    /// Profile authenticating with a private key file
    pub fn with_key(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            key_path: Some(key_path.into()),
            remote_path: remote_path.into(),
            ..Default::default()
        }
    }

    /// `host:port` address used for dialing
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Label for logs and progress events
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.host)
    }

    /// Resolves the single configured authentication method.
    ///
    /// Exactly one of `password` and `key_path` must be set.
    pub fn auth(&self) -> Result<AuthMethod> {
        let password = self.password.as_deref().filter(|p| !p.is_empty());
        let key_path = self.key_path.as_ref().filter(|p| !p.as_os_str().is_empty());
        match (password, key_path) {
            (Some(_), Some(_)) => Err(DeployError::Config(
                "both password and key_path are set, configure exactly one".to_string(),
            )),
            (Some(password), None) => Ok(AuthMethod::Password(password.to_string())),
            (None, Some(path)) => Ok(AuthMethod::PrivateKey(path.clone())),
            (None, None) => Err(DeployError::Config(
                "either a password or a key_path must be provided".to_string(),
            )),
        }
    }

    /// Checks the profile is complete and picks a backend for it
    pub fn validate(&self) -> Result<(AuthMethod, SshBackend)> {
        if self.host.trim().is_empty() {
            return Err(DeployError::Config("host is empty".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(DeployError::Config("username is empty".to_string()));
        }
        let auth = self.auth()?;
        let backend = match (self.backend, &auth) {
            (SshBackend::System, AuthMethod::Password(_)) => {
                return Err(DeployError::Config(
                    "the system ssh backend cannot authenticate with a password".to_string(),
                ));
            }
            (SshBackend::Auto, AuthMethod::Password(_)) => SshBackend::Native,
            (SshBackend::Auto, AuthMethod::PrivateKey(_)) => SshBackend::System,
            (backend, _) => backend,
        };
        Ok((auth, backend))
    }
}

/// One file to transfer in the current run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTask {
    /// Id of the persisted task backing this transfer
    pub id: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    /// Local modification time at planning, `None` for resumed tasks
    pub mod_time: Option<SystemTime>,
}

/// Durable projection of a [`FileTask`], the unit of resumability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

impl PersistedTask {
    /// Mints a fresh persisted task with a new random id
    pub fn new(local_path: impl AsRef<Path>, remote_path: impl Into<String>, size: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            local_path: local_path.as_ref().to_path_buf(),
            remote_path: remote_path.into(),
            size,
            completed: false,
            created_at: Utc::now(),
        }
    }
}

impl FileTask {
    /// New task for a freshly planned file, with a new random id
    pub fn new(
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        size: u64,
        mod_time: Option<SystemTime>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            local_path: local_path.into(),
            remote_path: remote_path.into(),
            size,
            mod_time,
        }
    }
}

impl From<&FileTask> for PersistedTask {
    fn from(task: &FileTask) -> Self {
        Self {
            id: task.id.clone(),
            local_path: task.local_path.clone(),
            remote_path: task.remote_path.clone(),
            size: task.size,
            completed: false,
            created_at: Utc::now(),
        }
    }
}

impl From<&PersistedTask> for FileTask {
    fn from(task: &PersistedTask) -> Self {
        Self {
            id: task.id.clone(),
            local_path: task.local_path.clone(),
            remote_path: task.remote_path.clone(),
            size: task.size,
            mod_time: None,
        }
    }
}

/// A file that still failed after the retry pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub remote_path: String,
    pub error: String,
}

/// Outcome of one deployment run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub message: String,
    pub files_deployed: usize,
    pub bytes_transferred: u64,
    /// Free-form run output, including every residual failure
    pub output: String,
    /// Run stopped on the pause flag, unfinished tasks stay in the store
    pub paused: bool,
    pub failures: Vec<FileFailure>,
}

impl DeployResult {
    pub(crate) fn failed(error: &DeployError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            output: format!("deployment aborted: {error}"),
            ..Default::default()
        }
    }
}
