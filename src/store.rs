//! Durable queue of transfer tasks.
//!
//! The store is the only source of truth for what a future run can resume.
//! It owns its own synchronization; the engine treats it as opaque.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::types::PersistedTask;

/// Persistence contract consumed by the engine
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Tasks not yet marked completed, in insertion order
    async fn list_pending(&self) -> Result<Vec<PersistedTask>, anyhow::Error>;

    /// Replaces the whole task list
    async fn replace_all(&self, tasks: Vec<PersistedTask>) -> Result<(), anyhow::Error>;

    /// Flags one task as completed; unknown ids are ignored
    async fn mark_completed(&self, id: &str) -> Result<(), anyhow::Error>;

    /// Deletes every completed task
    async fn remove_completed(&self) -> Result<(), anyhow::Error>;

    async fn is_paused(&self) -> Result<bool, anyhow::Error>;

    async fn set_paused(&self, paused: bool) -> Result<(), anyhow::Error>;

    async fn pending_count(&self) -> Result<usize, anyhow::Error> {
        Ok(self.list_pending().await?.len())
    }
}

/// Snapshot persisted by the stores
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQueueState {
    #[serde(default)]
    pub tasks: Vec<PersistedTask>,
    #[serde(default)]
    pub is_paused: bool,
}

impl TaskQueueState {
    fn pending(&self) -> Vec<PersistedTask> {
        self.tasks.iter().filter(|t| !t.completed).cloned().collect()
    }

    fn mark_completed(&mut self, id: &str) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if !task.completed => {
                task.completed = true;
                true
            }
            _ => false,
        }
    }

    fn remove_completed(&mut self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|t| !t.completed);
        before - self.tasks.len()
    }
}

/// Process-local store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    state: Mutex<TaskQueueState>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task including completed ones
    pub async fn snapshot(&self) -> TaskQueueState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn list_pending(&self) -> Result<Vec<PersistedTask>, anyhow::Error> {
        Ok(self.state.lock().await.pending())
    }

    async fn replace_all(&self, tasks: Vec<PersistedTask>) -> Result<(), anyhow::Error> {
        self.state.lock().await.tasks = tasks;
        Ok(())
    }

    async fn mark_completed(&self, id: &str) -> Result<(), anyhow::Error> {
        self.state.lock().await.mark_completed(id);
        Ok(())
    }

    async fn remove_completed(&self) -> Result<(), anyhow::Error> {
        self.state.lock().await.remove_completed();
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, anyhow::Error> {
        Ok(self.state.lock().await.is_paused)
    }

    async fn set_paused(&self, paused: bool) -> Result<(), anyhow::Error> {
        self.state.lock().await.is_paused = paused;
        Ok(())
    }
}

/// Store persisting its state to a JSON file after every change
#[derive(Debug)]
pub struct JsonTaskStore {
    path: PathBuf,
    state: Mutex<TaskQueueState>,
}

impl JsonTaskStore {
    /// Opens the store at `path`; a missing file is an empty store
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read(&path).await {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("corrupt task store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TaskQueueState::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read task store {}", path.display()));
            }
        };
        info!(
            path = %path.display(),
            pending = state.pending().len(),
            "Task store opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, state: &TaskQueueState) -> Result<(), anyhow::Error> {
        let data = serde_json::to_vec_pretty(state).context("cannot serialize task store")?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        // Write-then-rename so a crash never leaves a half written file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("cannot replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), tasks = state.tasks.len(), "Task store saved");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn list_pending(&self) -> Result<Vec<PersistedTask>, anyhow::Error> {
        Ok(self.state.lock().await.pending())
    }

    async fn replace_all(&self, tasks: Vec<PersistedTask>) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        state.tasks = tasks;
        self.persist(&state).await
    }

    async fn mark_completed(&self, id: &str) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if state.mark_completed(id) {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn remove_completed(&self) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        if state.remove_completed() > 0 {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, anyhow::Error> {
        Ok(self.state.lock().await.is_paused)
    }

    async fn set_paused(&self, paused: bool) -> Result<(), anyhow::Error> {
        let mut state = self.state.lock().await;
        state.is_paused = paused;
        self.persist(&state).await
    }
}
