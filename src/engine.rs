//! Deployment entry points.
//!
//! One run: connect, create the remote root, resume the stored backlog or
//! plan a fresh one, transfer, clean the store up and summarize.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::operations::plan;
use crate::operations::upload::ensure_remote_dir;
use crate::progress::{EventKind, ProgressEvent, ProgressSink, Status};
use crate::remote::RemoteShell;
use crate::scheduler::{TransferReport, TransferScheduler};
use crate::session::{Connector, SshConnector};
use crate::store::TaskStore;
use crate::types::{DeployResult, FileTask, PersistedTask, ServerProfile};

/// Pushes a local directory tree to a remote server over SSH
pub struct DeployEngine {
    connector: Arc<dyn Connector>,
    store: Arc<dyn TaskStore>,
    progress: Arc<dyn ProgressSink>,
    config: DeployConfig,
}

impl std::fmt::Debug for DeployEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeployEngine {
    /// Creates an engine from its collaborators
    ///
    /// # Arguments
    ///
    /// * `connector` - Opens the SSH connection of each run
    /// * `store` - Durable task queue, also owner of the pause flag
    /// * `progress` - Receives every state change of a run
    /// * `config` - Worker count, timeouts and retry tuning
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn TaskStore>,
        progress: Arc<dyn ProgressSink>,
        config: DeployConfig,
    ) -> Self {
        Self {
            connector,
            store,
            progress,
            config,
        }
    }

    /// Creates an engine dialing real SSH servers
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = Arc::new(JsonTaskStore::open("tasks.json").await?);
    /// let engine = DeployEngine::with_ssh(store, Arc::new(TracingProgress), DeployConfig::default());
    /// let result = engine.execute_deployment(&profile, "public", "/var/www/site", true).await;
    /// ```
    pub fn with_ssh(
        store: Arc<dyn TaskStore>,
        progress: Arc<dyn ProgressSink>,
        config: DeployConfig,
    ) -> Self {
        Self::new(Arc::new(SshConnector), store, progress, config)
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    fn emit(&self, profile: &ServerProfile, event: ProgressEvent) {
        self.progress
            .report(event.server(profile.id.as_deref(), Some(profile.display_name())));
    }

    /// Connects, runs a trivial command and disconnects
    ///
    /// # Errors
    ///
    /// Returns `DeployError::Config` for an incomplete profile and
    /// `DeployError::Connection` when the server cannot be reached or the
    /// test command does not answer as expected.
    pub async fn test_connection(&self, profile: &ServerProfile) -> Result<()> {
        let mut session = self.connector.open(profile, &self.config).await?;
        let outcome = session.test_connection().await;
        if let Err(e) = session.close().await {
            warn!(host = %profile.host, error = %e, "Failed to close test connection");
        }
        match &outcome {
            Ok(()) => info!(host = %profile.host, "Connection test passed"),
            Err(e) => error!(host = %profile.host, error = %e, "Connection test failed"),
        }
        outcome
    }

    /// Deploys `local_dir` to `remote_dir` on the server of `profile`
    ///
    /// An empty `remote_dir` falls back to `profile.remote_path`. In
    /// incremental mode files whose remote copy is up to date are skipped.
    ///
    /// # Returns
    ///
    /// Always a [`DeployResult`]; connection and remote root failures yield
    /// `success: false`, per-file failures are listed in
    /// [`DeployResult::failures`].
    pub async fn execute_deployment(
        &self,
        profile: &ServerProfile,
        local_dir: impl AsRef<Path>,
        remote_dir: &str,
        incremental: bool,
    ) -> DeployResult {
        self.execute_deployment_with_cancel(
            profile,
            local_dir,
            remote_dir,
            incremental,
            CancellationToken::new(),
        )
        .await
    }

    /// Same as [`Self::execute_deployment`], stoppable through `cancel`
    ///
    /// Cancelling lets in-flight transfers finish and leaves every unstarted
    /// task pending in the store.
    pub async fn execute_deployment_with_cancel(
        &self,
        profile: &ServerProfile,
        local_dir: impl AsRef<Path>,
        remote_dir: &str,
        incremental: bool,
        cancel: CancellationToken,
    ) -> DeployResult {
        let started = Instant::now();
        match self
            .run(profile, local_dir.as_ref(), remote_dir, incremental, cancel)
            .await
        {
            Ok(result) => {
                info!(
                    success = result.success,
                    files = result.files_deployed,
                    bytes = result.bytes_transferred,
                    "Deployment finished. Time taken {:?}",
                    started.elapsed()
                );
                result
            }
            Err(e) => {
                error!(host = %profile.host, error = %e, "Deployment failed");
                self.emit(
                    profile,
                    ProgressEvent::new(EventKind::Error, Status::Failed, e.to_string()),
                );
                DeployResult::failed(&e)
            }
        }
    }

    async fn run(
        &self,
        profile: &ServerProfile,
        local_dir: &Path,
        remote_dir: &str,
        incremental: bool,
        cancel: CancellationToken,
    ) -> Result<DeployResult> {
        profile.validate()?;
        let remote_root = resolve_remote_root(profile, remote_dir)?;
        check_local_dir(local_dir).await?;

        // The deadline bounds every phase, connecting and planning included
        let run_token = cancel.child_token();
        let deadline = self.spawn_deadline(run_token.clone());
        let outcome = self
            .connect_and_deploy(profile, local_dir, &remote_root, incremental, &cancel, &run_token)
            .await;
        deadline.abort();
        outcome
    }

    async fn connect_and_deploy(
        &self,
        profile: &ServerProfile,
        local_dir: &Path,
        remote_root: &str,
        incremental: bool,
        cancel: &CancellationToken,
        run_token: &CancellationToken,
    ) -> Result<DeployResult> {
        self.emit(
            profile,
            ProgressEvent::new(
                EventKind::Deploy,
                Status::Deploying,
                format!("Connecting to {}", profile.display_name()),
            ),
        );
        let mut session = self
            .until_stopped(cancel, run_token, self.connector.open(profile, &self.config))
            .await?;
        let outcome = match session.shell() {
            Ok(shell) => {
                self.deploy(shell, profile, local_dir, remote_root, incremental, cancel, run_token)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = session.close().await {
            warn!(host = %profile.host, error = %e, "Failed to close ssh connection");
        }
        outcome
    }

    async fn deploy(
        &self,
        shell: Arc<dyn RemoteShell>,
        profile: &ServerProfile,
        local_dir: &Path,
        remote_root: &str,
        incremental: bool,
        cancel: &CancellationToken,
        run_token: &CancellationToken,
    ) -> Result<DeployResult> {
        self.until_stopped(cancel, run_token, ensure_remote_dir(shell.as_ref(), remote_root))
            .await?;

        let tasks = self
            .until_stopped(
                cancel,
                run_token,
                self.load_or_plan(shell.as_ref(), profile, local_dir, remote_root, incremental),
            )
            .await?;
        let total = tasks.len();
        if total == 0 {
            self.cleanup_store().await;
            let message = "No files need to be transferred".to_string();
            self.emit(
                profile,
                ProgressEvent::new(EventKind::Complete, Status::Success, message.clone())
                    .counts(0, 0),
            );
            return Ok(DeployResult {
                success: true,
                output: message.clone(),
                message,
                ..Default::default()
            });
        }

        self.emit(
            profile,
            ProgressEvent::new(
                EventKind::Deploy,
                Status::Deploying,
                format!("Starting transfer of {total} files"),
            )
            .counts(0, total),
        );

        let report = TransferScheduler::new(
            shell,
            Arc::clone(&self.store),
            Arc::clone(&self.progress),
            &self.config,
        )
        .with_server(profile.id.clone(), Some(profile.display_name().to_string()))
        .run(tasks, run_token.clone())
        .await;
        let timed_out = report.cancelled && !cancel.is_cancelled();

        self.cleanup_store().await;
        let pending = match self.store.pending_count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Cannot count pending tasks");
                total.saturating_sub(report.completed + report.vanished)
            }
        };

        let result = self.summarize(&report, pending, timed_out);
        let event = if result.paused {
            ProgressEvent::new(EventKind::Deploy, Status::Paused, result.message.clone())
        } else if result.success {
            ProgressEvent::new(EventKind::Complete, Status::Success, result.message.clone())
        } else {
            ProgressEvent::new(EventKind::Error, Status::Failed, result.message.clone())
        };
        self.emit(profile, event.counts(report.completed, total));
        Ok(result)
    }

    /// Resumes the stored backlog unless it is empty or paused, otherwise
    /// plans a fresh task list and stores it
    async fn load_or_plan(
        &self,
        shell: &dyn RemoteShell,
        profile: &ServerProfile,
        local_dir: &Path,
        remote_root: &str,
        incremental: bool,
    ) -> Result<Vec<FileTask>> {
        let pending = self.store.list_pending().await?;
        let paused = self.store.is_paused().await?;

        let tasks = if !pending.is_empty() && !paused {
            info!(pending = pending.len(), "Resuming unfinished deployment");
            self.emit(
                profile,
                ProgressEvent::new(
                    EventKind::Deploy,
                    Status::Deploying,
                    format!("Resuming {} pending files", pending.len()),
                ),
            );
            pending.iter().map(FileTask::from).collect()
        } else {
            self.emit(
                profile,
                ProgressEvent::new(
                    EventKind::Build,
                    Status::Building,
                    "Comparing local files with the server",
                ),
            );
            let tasks = plan::plan_tasks(shell, local_dir, remote_root, incremental).await?;
            self.store
                .replace_all(tasks.iter().map(PersistedTask::from).collect())
                .await?;
            tasks
        };
        self.store.set_paused(false).await?;
        Ok(tasks)
    }

    /// Runs `work` unless the run is stopped first
    async fn until_stopped<T>(
        &self,
        cancel: &CancellationToken,
        run_token: &CancellationToken,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = run_token.cancelled() => Err(self.interruption(cancel)),
            result = work => result,
        }
    }

    fn interruption(&self, cancel: &CancellationToken) -> DeployError {
        if cancel.is_cancelled() {
            DeployError::Interrupted("cancelled".to_string())
        } else {
            DeployError::Interrupted(format!(
                "timed out after {:?}",
                self.config.deploy_timeout()
            ))
        }
    }

    /// Cancels `token` once the deploy timeout elapses
    fn spawn_deadline(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let timeout = self.config.deploy_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    warn!("Deployment timed out after {:?}, no new transfers will start", timeout);
                    token.cancel();
                }
            }
        })
    }

    async fn cleanup_store(&self) {
        if let Err(e) = self.store.remove_completed().await {
            warn!(error = %e, "Failed to remove completed tasks from the store");
        }
    }

    fn summarize(&self, report: &TransferReport, pending: usize, timed_out: bool) -> DeployResult {
        let mut output = Vec::new();
        output.push(format!(
            "{} of {} files transferred ({} bytes)",
            report.completed, report.total, report.bytes_transferred
        ));
        if report.vanished > 0 {
            output.push(format!(
                "{} files were removed locally before transfer",
                report.vanished
            ));
        }
        for failure in &report.failures {
            output.push(format!("failed: {}: {}", failure.remote_path, failure.error));
        }

        let (success, message) = if report.paused {
            output.push(format!("{pending} files remain pending"));
            (
                true,
                format!(
                    "Deployment paused after {} of {} files, {} pending",
                    report.completed, report.total, pending
                ),
            )
        } else if report.cancelled {
            output.push(format!("{pending} files remain pending"));
            let reason = if timed_out {
                format!("timed out after {:?}", self.config.deploy_timeout())
            } else {
                "cancelled".to_string()
            };
            (
                false,
                format!(
                    "Deployment {reason}: {} of {} files transferred",
                    report.completed, report.total
                ),
            )
        } else if report.failures.is_empty() {
            (
                true,
                format!(
                    "Successfully deployed {} files ({} bytes)",
                    report.completed, report.bytes_transferred
                ),
            )
        } else {
            let tolerated = !self.config.require_zero_failures && report.completed > 0;
            (
                tolerated,
                format!(
                    "Deployed {} of {} files, {} failed",
                    report.completed,
                    report.total,
                    report.failures.len()
                ),
            )
        };

        DeployResult {
            success,
            message,
            files_deployed: report.completed,
            bytes_transferred: report.bytes_transferred,
            output: output.join("\n"),
            paused: report.paused,
            failures: report.failures.clone(),
        }
    }
}

fn resolve_remote_root(profile: &ServerProfile, remote_dir: &str) -> Result<String> {
    let root = if remote_dir.trim().is_empty() {
        profile.remote_path.trim()
    } else {
        remote_dir.trim()
    };
    if root.is_empty() {
        return Err(DeployError::Config(
            "no remote directory given and profile has no remote_path".to_string(),
        ));
    }
    Ok(root.to_string())
}

async fn check_local_dir(local_dir: &Path) -> Result<()> {
    match tokio::fs::metadata(local_dir).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(DeployError::LocalSource(format!(
            "{} is not a directory",
            local_dir.display()
        ))),
        Err(e) => Err(DeployError::LocalSource(format!(
            "cannot access {}: {e}",
            local_dir.display()
        ))),
    }
}
