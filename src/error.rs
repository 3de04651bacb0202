//! Error taxonomy for a deployment run

use std::fmt;

use thiserror::Error;

/// Classified cause of a failed remote write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    PermissionDenied,
    DiskFull,
    MissingDirectory,
    ReadOnlyFilesystem,
    ConnectionIssue,
    Unknown,
}

impl TransferErrorKind {
    /// Classifies remote diagnostic output.
    ///
    /// Matching is case-insensitive and the first matching class wins, so
    /// "permission denied" beats "no such file or directory" when both show up.
    pub fn classify(diagnostic: &str) -> Self {
        let lower = diagnostic.to_lowercase();
        if lower.contains("permission denied") {
            Self::PermissionDenied
        } else if lower.contains("no space left") || lower.contains("disk full") {
            Self::DiskFull
        } else if lower.contains("no such file or directory") {
            Self::MissingDirectory
        } else if lower.contains("read-only") {
            Self::ReadOnlyFilesystem
        } else if lower.contains("connection") {
            Self::ConnectionIssue
        } else {
            Self::Unknown
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission denied: remote directory is not writable",
            Self::DiskFull => "remote disk is full",
            Self::MissingDirectory => "remote directory does not exist",
            Self::ReadOnlyFilesystem => "remote filesystem is read-only",
            Self::ConnectionIssue => "SSH connection is unstable",
            Self::Unknown => "remote write failed",
        }
    }
}

impl fmt::Display for TransferErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Main error type for deployments
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Directory error: cannot create {path}: {message}")]
    Directory { path: String, message: String },

    #[error("Transfer error for {path}: {kind} ({detail})")]
    Transfer {
        path: String,
        kind: TransferErrorKind,
        detail: String,
    },

    #[error("Verification error for {path}: expected {expected} bytes, found {actual}")]
    Verification {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Local source error: {0}")]
    LocalSource(String),

    #[error("Task store error: {0}")]
    Store(String),

    /// The run deadline or the caller stopped the run before any transfer
    #[error("Deployment {0}")]
    Interrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Whether the single retry pass should pick this failure up
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transfer { .. } | Self::Verification { .. } | Self::Directory { .. } | Self::Io(_)
        )
    }
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Store(format!("{err:#}"))
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
