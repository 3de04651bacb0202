use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::ServerProfile;

/// Tuning knobs for a deployment run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Number of concurrent transfer workers
    pub workers: usize,
    /// Dial and handshake timeout in seconds
    pub connect_timeout_secs: u64,
    /// Upper bound on one whole run in seconds
    pub deploy_timeout_secs: u64,
    /// Pause between two files of the retry pass in milliseconds
    pub retry_delay_ms: u64,
    /// Buffer size for streaming a file to the remote host in bytes
    pub io_size: usize,
    /// Report `success = false` whenever a file still fails after retry
    pub require_zero_failures: bool,
    /// Directory for OpenSSH control sockets
    pub control_dir: PathBuf,
}

impl Default for DeployConfig {
    /// - workers: 4
    /// - connect timeout: 15s
    /// - deploy timeout: 5 minutes
    /// - retry delay: 100ms
    /// - io_size: 65536 (64KB)
    fn default() -> Self {
        Self {
            workers: 4,
            connect_timeout_secs: 15,
            deploy_timeout_secs: 300,
            retry_delay_ms: 100,
            io_size: 65536,
            require_zero_failures: false,
            control_dir: std::env::temp_dir(),
        }
    }
}

impl DeployConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Worker count, never below one
    pub fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    /// Loads a config from a JSON file, missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read deploy config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid deploy config {}", path.display()))
    }
}

impl ServerProfile {
    /// Loads a server profile from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read server profile {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("invalid server profile {}", path.display()))
    }
}
