mod common;

use std::sync::Arc;

use common::*;
use sitepush::{
    CancellationToken, DeployError, FileTask, MemoryTaskStore, NoProgress, PersistedTask,
    RemoteShell, TaskStore, TransferErrorKind, TransferScheduler, UploadOutcome,
};

fn task_for(local: &std::path::Path, relative: &str) -> FileTask {
    let path = local.join(relative);
    let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
    FileTask::new(path, remote(relative), size, None)
}

#[tokio::test]
async fn put_creates_parents_and_restores_mtime() {
    let local = site(&[("deep/nested/page.html", b"<p>hi</p>")]);
    let remote_host = FakeRemote::new();

    let outcome = sitepush::put(
        remote_host.as_ref(),
        &task_for(local.path(), "deep/nested/page.html"),
        4,
    )
    .await
    .unwrap();

    assert_eq!(outcome, UploadOutcome::Transferred { bytes: 9 });
    let file = remote_host.file(&remote("deep/nested/page.html")).unwrap();
    assert_eq!(file.data, b"<p>hi</p>");
    assert_eq!(file.mtime, LOCAL_MTIME as i64);
}

#[tokio::test]
async fn put_classifies_remote_write_errors() {
    let local = site(&[("a.txt", b"abc")]);
    let remote_host = FakeRemote::new();
    remote_host.fail_writes(&remote("a.txt"), 1);

    let err = sitepush::put(remote_host.as_ref(), &task_for(local.path(), "a.txt"), 1024)
        .await
        .unwrap_err();

    match err {
        DeployError::Transfer { kind, path, .. } => {
            assert_eq!(kind, TransferErrorKind::ConnectionIssue);
            assert_eq!(path, remote("a.txt"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn put_of_missing_source_is_not_an_error() {
    let local = site(&[]);
    let remote_host = FakeRemote::new();
    let task = FileTask::new(local.path().join("gone.css"), remote("gone.css"), 10, None);

    let outcome = sitepush::put(remote_host.as_ref(), &task, 1024).await.unwrap();

    assert_eq!(outcome, UploadOutcome::SourceMissing);
    assert!(remote_host.commands().is_empty());
}

#[tokio::test]
async fn remote_stat_reads_size_and_absence() {
    let remote_host = FakeRemote::new();
    remote_host.seed("/srv/www/x", b"12345", 42);

    let present = sitepush::remote_stat(remote_host.as_ref(), "/srv/www/x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!((present.size, present.mtime), (5, 42));

    let absent = sitepush::remote_stat(remote_host.as_ref(), "/srv/www/y")
        .await
        .unwrap();
    assert!(absent.is_none());
}

async fn seeded_store(tasks: &[FileTask]) -> Arc<MemoryTaskStore> {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .replace_all(tasks.iter().map(PersistedTask::from).collect())
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn scheduler_counts_first_pass_failures_and_retries() {
    let local = site(&[("a", b"a"), ("b", b"bb"), ("c", b"ccc")]);
    let remote_host = FakeRemote::new();
    remote_host.fail_writes(&remote("b"), 1);
    let tasks: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| task_for(local.path(), name))
        .collect();
    let store = seeded_store(&tasks).await;

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(3))
        .run(tasks, CancellationToken::new())
        .await;

    assert_eq!(report.total, 3);
    assert_eq!(report.completed, 3);
    assert_eq!(report.first_pass_failures, 1);
    assert_eq!(report.bytes_transferred, 6);
    assert!(report.failures.is_empty());
    assert!(!report.paused && !report.cancelled);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn scheduler_reports_persistent_failures() {
    let local = site(&[("ok", b"ok"), ("bad", b"bad")]);
    let remote_host = FakeRemote::new();
    remote_host.fail_writes(&remote("bad"), 5);
    let tasks = vec![task_for(local.path(), "ok"), task_for(local.path(), "bad")];
    let store = seeded_store(&tasks).await;

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(2))
        .run(tasks, CancellationToken::new())
        .await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].remote_path, remote("bad"));
    assert_eq!(remote_host.writes(&remote("bad")), 2);
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn scheduler_stops_dequeuing_once_paused() {
    let local = site(&[("1", b"1"), ("2", b"2"), ("3", b"3"), ("4", b"4")]);
    let remote_host = FakeRemote::new();
    let tasks: Vec<_> = ["1", "2", "3", "4"]
        .iter()
        .map(|name| task_for(local.path(), name))
        .collect();
    let store = seeded_store(&tasks).await;
    remote_host.pause_after(1, store.clone());

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(1))
        .run(tasks, CancellationToken::new())
        .await;

    assert!(report.paused);
    assert!(!report.cancelled);
    assert_eq!(report.completed, 1);
    assert_eq!(remote_host.total_writes(), 1);
    assert_eq!(store.pending_count().await.unwrap(), 3);
}

#[tokio::test]
async fn put_treats_a_dropped_verification_stat_as_a_connection_issue() {
    let local = site(&[("page.html", b"<p>page</p>")]);
    let remote_host = FakeRemote::new();
    remote_host.drop_stats(&remote("page.html"), 1);

    let err = sitepush::put(remote_host.as_ref(), &task_for(local.path(), "page.html"), 1024)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    match err {
        DeployError::Transfer { kind, path, .. } => {
            assert_eq!(kind, TransferErrorKind::ConnectionIssue);
            assert_eq!(path, remote("page.html"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn put_fails_when_the_written_file_is_not_on_the_server() {
    let local = site(&[("empty.txt", b"")]);
    let remote_host = FakeRemote::new();
    remote_host.discard_writes(&remote("empty.txt"));

    let err = sitepush::put(remote_host.as_ref(), &task_for(local.path(), "empty.txt"), 1024)
        .await
        .unwrap_err();

    match err {
        DeployError::Transfer { path, detail, .. } => {
            assert_eq!(path, remote("empty.txt"));
            assert!(detail.contains("missing"), "{detail}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(remote_host.file(&remote("empty.txt")).is_none());
}

#[tokio::test]
async fn scheduler_retries_a_dropped_verification_stat() {
    let local = site(&[("a", b"a"), ("b", b"bb")]);
    let remote_host = FakeRemote::new();
    remote_host.drop_stats(&remote("b"), 1);
    let tasks = vec![task_for(local.path(), "a"), task_for(local.path(), "b")];
    let store = seeded_store(&tasks).await;

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(2))
        .run(tasks, CancellationToken::new())
        .await;

    assert_eq!(report.completed, 2);
    assert_eq!(report.first_pass_failures, 1);
    assert!(report.failures.is_empty());
    assert_eq!(remote_host.writes(&remote("b")), 2);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn scheduler_never_completes_a_file_missing_after_write() {
    let local = site(&[("kept", b"kept"), ("lost", b"")]);
    let remote_host = FakeRemote::new();
    remote_host.discard_writes(&remote("lost"));
    let tasks = vec![task_for(local.path(), "kept"), task_for(local.path(), "lost")];
    let store = seeded_store(&tasks).await;

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(2))
        .run(tasks, CancellationToken::new())
        .await;

    assert_eq!(report.completed, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].remote_path, remote("lost"));
    let pending = store.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].remote_path, remote("lost"));
}

#[tokio::test]
async fn scheduler_reports_each_successful_retry() {
    let local = site(&[("a", b"a"), ("b", b"bb")]);
    let remote_host = FakeRemote::new();
    remote_host.fail_writes(&remote("b"), 1);
    let tasks = vec![task_for(local.path(), "a"), task_for(local.path(), "b")];
    let store = seeded_store(&tasks).await;
    let progress = Arc::new(RecordingProgress::default());

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store, progress.clone(), &test_config(1))
        .run(tasks, CancellationToken::new())
        .await;
    assert_eq!(report.completed, 2);

    let events = progress.events();
    let retried = events
        .iter()
        .find(|e| e.message.starts_with("Retry succeeded"))
        .expect("no event for the retried file");
    assert_eq!(retried.current_file.as_deref(), Some("b"));
    assert_eq!((retried.current, retried.total), (2, 2));
}

#[tokio::test]
async fn scheduler_is_not_cancelled_when_every_task_already_ran() {
    let local = site(&[("a", b"a"), ("b", b"b")]);
    let remote_host = FakeRemote::new();
    let cancel = CancellationToken::new();
    remote_host.cancel_after(2, cancel.clone());
    let tasks = vec![task_for(local.path(), "a"), task_for(local.path(), "b")];
    let store = seeded_store(&tasks).await;

    let shell: Arc<dyn RemoteShell> = remote_host.clone();
    let report = TransferScheduler::new(shell, store.clone(), Arc::new(NoProgress), &test_config(1))
        .run(tasks, cancel.clone())
        .await;

    assert!(cancel.is_cancelled());
    assert_eq!(report.completed, 2);
    assert!(!report.cancelled && !report.paused);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}
