// Module declarations
mod config;
mod engine;
mod error;
mod operations;
mod progress;
mod remote;
mod scheduler;
mod session;
mod store;
mod types;

// Public API exports
pub use config::DeployConfig;
pub use engine::DeployEngine;
pub use error::{DeployError, Result, TransferErrorKind};
pub use operations::plan::{LocalFile, plan_tasks, remote_path_for, walk_local};
pub use operations::probe::{needs_transfer, remote_stat, should_transfer};
pub use operations::upload::{UploadOutcome, ensure_remote_dir, put};
pub use progress::{
    BroadcastProgress, EventKind, NoProgress, ProgressEvent, ProgressSink, Status,
    TracingProgress,
};
pub use remote::{ABSENT_SENTINEL, CommandOutput, RemoteShell, RemoteStat, commands, parse_stat};
pub use scheduler::{TransferReport, TransferScheduler};
pub use session::{Connector, SshConnector, SshSessionManager};
pub use store::{JsonTaskStore, MemoryTaskStore, TaskQueueState, TaskStore};
pub use types::{
    AuthMethod, DeployResult, FileFailure, FileTask, HostKeyPolicy, PersistedTask, ServerProfile,
    SshBackend,
};

// Re-export commonly used external types for convenience
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
