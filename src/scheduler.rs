//! Concurrent transfer of a planned task list.
//!
//! A fixed pool of workers drains a shared queue. Before every dequeue a
//! worker consults the pause flag of the task store; once it is set no new
//! transfer starts, while transfers already running are allowed to finish.
//! Failed tasks are retried once, sequentially, after the concurrent pass.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeployConfig;
use crate::error::DeployError;
use crate::operations::upload::{self, UploadOutcome};
use crate::progress::{EventKind, ProgressEvent, ProgressSink, Status};
use crate::remote::RemoteShell;
use crate::store::TaskStore;
use crate::types::{FileFailure, FileTask};

/// Counters of one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    pub total: usize,
    /// Files written and verified, including those fixed by the retry pass
    pub completed: usize,
    pub bytes_transferred: u64,
    /// Tasks resolved because their local source disappeared
    pub vanished: usize,
    /// Failures observed during the concurrent pass, before retrying
    pub first_pass_failures: usize,
    /// Files still failing after the retry pass
    pub failures: Vec<FileFailure>,
    /// Stopped on the pause flag with work left undone
    pub paused: bool,
    /// Stopped by the run deadline or the caller with work left undone
    pub cancelled: bool,
}

/// Runs transfer tasks on a fixed-size worker pool
pub struct TransferScheduler {
    shell: Arc<dyn RemoteShell>,
    store: Arc<dyn TaskStore>,
    progress: Arc<dyn ProgressSink>,
    workers: usize,
    retry_delay: Duration,
    io_size: usize,
    server_id: Option<String>,
    server_name: Option<String>,
}

/// State shared by the workers of one run
struct RunState {
    total: usize,
    queue: Mutex<mpsc::Receiver<FileTask>>,
    retry_tx: mpsc::Sender<(FileTask, String)>,
    /// Failures reported without a retry
    overflow: Mutex<Vec<FileFailure>>,
    /// Tasks taken off the queue by a worker
    started: AtomicUsize,
    completed: AtomicUsize,
    vanished: AtomicUsize,
    failed: AtomicUsize,
    bytes: AtomicU64,
    paused: AtomicBool,
    /// Retry pass stopped before every failed task was retried
    retry_interrupted: AtomicBool,
    /// Tripped on pause, deadline or caller cancellation
    stop: CancellationToken,
}

impl RunState {
    fn resolved(&self) -> usize {
        self.completed.load(Ordering::SeqCst) + self.vanished.load(Ordering::SeqCst)
    }
}

fn file_name(remote_path: &str) -> String {
    Path::new(remote_path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| remote_path.to_string())
}

impl TransferScheduler {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        store: Arc<dyn TaskStore>,
        progress: Arc<dyn ProgressSink>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            shell,
            store,
            progress,
            workers: config.worker_count(),
            retry_delay: config.retry_delay(),
            io_size: config.io_size,
            server_id: None,
            server_name: None,
        }
    }

    /// Tags every progress event with a server identity
    pub fn with_server(mut self, id: Option<String>, name: Option<String>) -> Self {
        self.server_id = id;
        self.server_name = name;
        self
    }

    fn emit(&self, event: ProgressEvent) {
        self.progress.report(
            event.server(self.server_id.as_deref(), self.server_name.as_deref()),
        );
    }

    async fn paused(&self) -> bool {
        match self.store.is_paused().await {
            Ok(paused) => paused,
            Err(e) => {
                warn!(error = %e, "Cannot read pause flag, continuing");
                false
            }
        }
    }

    async fn mark_completed(&self, task: &FileTask) {
        if let Err(e) = self.store.mark_completed(&task.id).await {
            error!(id = %task.id, path = %task.remote_path, error = %e, "Failed to mark task completed");
        }
    }

    /// Transfers `tasks` and returns once every worker stopped and the retry
    /// pass finished.
    ///
    /// Per-file failures never abort the run; they are retried once and then
    /// reported in [`TransferReport::failures`].
    pub async fn run(&self, tasks: Vec<FileTask>, cancel: CancellationToken) -> TransferReport {
        let total = tasks.len();
        let capacity = total.max(1);
        let (task_tx, task_rx) = mpsc::channel::<FileTask>(capacity);
        let (retry_tx, mut retry_rx) = mpsc::channel::<(FileTask, String)>(capacity);

        let state = Arc::new(RunState {
            total,
            queue: Mutex::new(task_rx),
            retry_tx,
            overflow: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            vanished: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            retry_interrupted: AtomicBool::new(false),
            stop: cancel.child_token(),
        });

        // Feeder: stops handing out work as soon as the run is stopped
        let feeder_stop = state.stop.clone();
        let feeder = tokio::spawn(async move {
            for task in tasks {
                tokio::select! {
                    biased;
                    _ = feeder_stop.cancelled() => {
                        debug!("Task dispatch stopped");
                        break;
                    }
                    sent = task_tx.send(task) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut workers = FuturesUnordered::new();
        for idx in 0..self.workers.min(capacity) {
            workers.push(self.worker(idx + 1, Arc::clone(&state)));
        }
        while workers.next().await.is_some() {}
        feeder.abort();

        let completed = state.completed.load(Ordering::SeqCst);
        let first_pass_failures = state.failed.load(Ordering::SeqCst);
        info!(
            completed,
            failed = first_pass_failures,
            total,
            "Concurrent transfer pass finished"
        );

        let mut retry_tasks = Vec::new();
        retry_rx.close();
        while let Ok(entry) = retry_rx.try_recv() {
            retry_tasks.push(entry);
        }
        let mut failures = std::mem::take(&mut *state.overflow.lock().await);
        failures.extend(self.retry(&state, retry_tasks).await);

        // A stop only counts when it actually kept work from running
        let left_undone = state.started.load(Ordering::SeqCst) < total
            || state.retry_interrupted.load(Ordering::SeqCst);
        let paused = left_undone && state.paused.load(Ordering::SeqCst);
        let cancelled = left_undone && !paused && cancel.is_cancelled();
        let report = TransferReport {
            total,
            completed: state.completed.load(Ordering::SeqCst),
            bytes_transferred: state.bytes.load(Ordering::SeqCst),
            vanished: state.vanished.load(Ordering::SeqCst),
            first_pass_failures,
            failures,
            paused,
            cancelled,
        };
        info!(
            completed = report.completed,
            failed = report.failures.len(),
            paused = report.paused,
            cancelled = report.cancelled,
            "Transfer finished"
        );
        report
    }

    async fn worker(&self, idx: usize, state: Arc<RunState>) {
        loop {
            if state.stop.is_cancelled() {
                break;
            }
            if self.paused().await {
                info!(worker = idx, "Pause requested, no new transfers will start");
                state.paused.store(true, Ordering::SeqCst);
                state.stop.cancel();
                break;
            }

            let next = {
                let mut queue = state.queue.lock().await;
                tokio::select! {
                    biased;
                    _ = state.stop.cancelled() => None,
                    task = queue.recv() => task,
                }
            };
            let Some(task) = next else {
                break;
            };
            state.started.fetch_add(1, Ordering::SeqCst);
            self.transfer_one(idx, &state, task).await;
        }
        debug!(worker = idx, "Worker finished");
    }

    async fn transfer_one(&self, idx: usize, state: &RunState, task: FileTask) {
        let name = file_name(&task.remote_path);
        let done = state.resolved();
        info!(
            worker = idx,
            local = %task.local_path.display(),
            remote = %task.remote_path,
            size = task.size,
            "Transferring file"
        );
        self.emit(
            ProgressEvent::new(
                EventKind::Deploy,
                Status::Deploying,
                format!("Uploading file ({}/{})", done + 1, state.total),
            )
            .counts(done, state.total)
            .file(name.clone()),
        );

        match upload::put(self.shell.as_ref(), &task, self.io_size).await {
            Ok(UploadOutcome::Transferred { bytes }) => {
                self.mark_completed(&task).await;
                state.bytes.fetch_add(bytes, Ordering::SeqCst);
                state.completed.fetch_add(1, Ordering::SeqCst);
                let done = state.resolved();
                self.emit(
                    ProgressEvent::new(
                        EventKind::Deploy,
                        Status::Deploying,
                        format!("Completed {}/{} files", done, state.total),
                    )
                    .counts(done, state.total),
                );
            }
            Ok(UploadOutcome::SourceMissing) => {
                self.mark_completed(&task).await;
                state.vanished.fetch_add(1, Ordering::SeqCst);
                let done = state.resolved();
                self.emit(
                    ProgressEvent::new(
                        EventKind::Deploy,
                        Status::Deploying,
                        format!("Skipped {name}: local file no longer exists"),
                    )
                    .counts(done, state.total),
                );
            }
            Err(e) => self.record_failure(idx, state, task, e).await,
        }
    }

    async fn record_failure(&self, idx: usize, state: &RunState, task: FileTask, e: DeployError) {
        state.failed.fetch_add(1, Ordering::SeqCst);
        warn!(
            worker = idx,
            local = %task.local_path.display(),
            remote = %task.remote_path,
            error = %e,
            "File upload failed"
        );
        self.emit(
            ProgressEvent::new(
                EventKind::Deploy,
                Status::Deploying,
                format!("Upload failed: {}", file_name(&task.remote_path)),
            )
            .counts(state.resolved(), state.total),
        );

        let message = e.to_string();
        if !e.is_retryable() {
            state.overflow.lock().await.push(FileFailure {
                remote_path: task.remote_path,
                error: message,
            });
            return;
        }
        match state.retry_tx.try_send((task, message)) {
            Ok(()) => debug!(worker = idx, "Queued failed task for retry"),
            Err(mpsc::error::TrySendError::Full((task, message)))
            | Err(mpsc::error::TrySendError::Closed((task, message))) => {
                warn!(worker = idx, path = %task.remote_path, "Retry queue full, reporting without retry");
                state.overflow.lock().await.push(FileFailure {
                    remote_path: task.remote_path,
                    error: message,
                });
            }
        }
    }

    /// Single sequential retry of every failed task
    async fn retry(&self, state: &RunState, tasks: Vec<(FileTask, String)>) -> Vec<FileFailure> {
        let mut failures = Vec::new();
        if tasks.is_empty() {
            return failures;
        }
        let count = tasks.len();
        info!(count, "Retrying failed files");
        self.emit(ProgressEvent::new(
            EventKind::Deploy,
            Status::Deploying,
            format!("Retrying {count} failed files"),
        ));

        let mut retried_ok = 0usize;
        let mut pending = tasks.into_iter().enumerate().peekable();
        while let Some((i, (task, last_error))) = pending.next() {
            let stopped_by_pause = !state.stop.is_cancelled() && self.paused().await;
            if stopped_by_pause {
                state.paused.store(true, Ordering::SeqCst);
                state.stop.cancel();
            }
            if state.stop.is_cancelled() {
                info!("Retry pass interrupted, remaining tasks stay pending");
                state.retry_interrupted.store(true, Ordering::SeqCst);
                failures.push(FileFailure {
                    remote_path: task.remote_path,
                    error: last_error,
                });
                failures.extend(pending.by_ref().map(|(_, (task, error))| FileFailure {
                    remote_path: task.remote_path,
                    error,
                }));
                break;
            }

            let name = file_name(&task.remote_path);
            self.emit(
                ProgressEvent::new(
                    EventKind::Deploy,
                    Status::Deploying,
                    format!("Retrying file ({}/{})", i + 1, count),
                )
                .counts(i + 1, count)
                .file(name.clone()),
            );

            match upload::put(self.shell.as_ref(), &task, self.io_size).await {
                Ok(UploadOutcome::Transferred { bytes }) => {
                    self.mark_completed(&task).await;
                    state.bytes.fetch_add(bytes, Ordering::SeqCst);
                    state.completed.fetch_add(1, Ordering::SeqCst);
                    retried_ok += 1;
                    info!(path = %task.remote_path, "Retry succeeded");
                    let done = state.resolved();
                    self.emit(
                        ProgressEvent::new(
                            EventKind::Deploy,
                            Status::Deploying,
                            format!("Retry succeeded: {name} ({}/{} files)", done, state.total),
                        )
                        .counts(done, state.total)
                        .file(name.clone()),
                    );
                }
                Ok(UploadOutcome::SourceMissing) => {
                    self.mark_completed(&task).await;
                    state.vanished.fetch_add(1, Ordering::SeqCst);
                    retried_ok += 1;
                }
                Err(e) => {
                    warn!(path = %task.remote_path, error = %e, "Retry failed");
                    self.emit(
                        ProgressEvent::new(
                            EventKind::Deploy,
                            Status::Deploying,
                            format!("Retry failed: {name}"),
                        )
                        .counts(state.resolved(), state.total)
                        .file(name.clone()),
                    );
                    failures.push(FileFailure {
                        remote_path: task.remote_path,
                        error: e.to_string(),
                    });
                }
            }

            if pending.peek().is_some() && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.emit(ProgressEvent::new(
            EventKind::Deploy,
            Status::Deploying,
            format!(
                "Retry finished: {} succeeded, {} failed",
                retried_ok,
                failures.len()
            ),
        ));
        failures
    }
}
