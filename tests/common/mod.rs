#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sitepush::{
    CancellationToken, CommandOutput, Connector, DeployConfig, DeployEngine, DeployError, MemoryTaskStore,
    PersistedTask, ProgressEvent, ProgressSink, RemoteShell, ServerProfile, SshSessionManager,
    TaskStore, async_trait,
};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};


pub const REMOTE_ROOT: &str = "/srv/www";

/// Fixed local modification time so remote comparisons are deterministic
pub const LOCAL_MTIME: u64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub data: Vec<u8>,
    pub mtime: i64,
}

#[derive(Default)]
struct Inner {
    files: HashMap<String, RemoteFile>,
    dirs: HashSet<String>,
    deny_mkdir: Vec<String>,
    transient_failures: HashMap<String, usize>,
    truncate: HashSet<String>,
    discard: HashSet<String>,
    stat_errors: HashMap<String, usize>,
    stat_delay: Option<Duration>,
    writes: HashMap<String, usize>,
    total_writes: usize,
    pause_after: Option<(usize, Arc<dyn TaskStore>)>,
    cancel_after: Option<(usize, CancellationToken)>,
    commands: Vec<String>,
}

/// In-memory POSIX host understanding the command lines the engine sends
#[derive(Default)]
pub struct FakeRemote {
    inner: Mutex<Inner>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_status: Some(0),
        stdout: stdout.into().into_bytes(),
        stderr: Vec::new(),
    }
}

fn fail(stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_status: Some(1),
        stdout: Vec::new(),
        stderr: stderr.into().into_bytes(),
    }
}

/// Splits a POSIX command line into words, honouring single quotes and
/// backslash escapes
pub fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    word.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        let remote = Self::default();
        remote.inner.lock().unwrap().dirs.insert("/".to_string());
        Arc::new(remote)
    }

    pub fn seed(&self, path: &str, data: &[u8], mtime: i64) {
        let mut inner = self.inner.lock().unwrap();
        let mut dir = parent(path).to_string();
        while dir != "/" {
            inner.dirs.insert(dir.clone());
            dir = parent(&dir).to_string();
        }
        inner.files.insert(
            path.to_string(),
            RemoteFile {
                data: data.to_vec(),
                mtime,
            },
        );
    }

    pub fn deny_mkdir(&self, prefix: &str) {
        self.inner.lock().unwrap().deny_mkdir.push(prefix.to_string());
    }

    pub fn fail_writes(&self, path: &str, times: usize) {
        self.inner
            .lock()
            .unwrap()
            .transient_failures
            .insert(path.to_string(), times);
    }

    pub fn truncate_writes(&self, path: &str) {
        self.inner.lock().unwrap().truncate.insert(path.to_string());
    }

    /// Accepts writes to `path` without keeping the data
    pub fn discard_writes(&self, path: &str) {
        self.inner.lock().unwrap().discard.insert(path.to_string());
    }

    /// The next `times` stats of `path` fail as if the session dropped
    pub fn drop_stats(&self, path: &str, times: usize) {
        self.inner
            .lock()
            .unwrap()
            .stat_errors
            .insert(path.to_string(), times);
    }

    /// Delays every stat by `delay`
    pub fn slow_stat(&self, delay: Duration) {
        self.inner.lock().unwrap().stat_delay = Some(delay);
    }

    /// Cancels `token` once `writes` files were written
    pub fn cancel_after(&self, writes: usize, token: CancellationToken) {
        self.inner.lock().unwrap().cancel_after = Some((writes, token));
    }

    /// Sets the pause flag of `store` once `writes` files were written
    pub fn pause_after(&self, writes: usize, store: Arc<dyn TaskStore>) {
        self.inner.lock().unwrap().pause_after = Some((writes, store));
    }

    pub fn file(&self, path: &str) -> Option<RemoteFile> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn writes(&self, path: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .writes
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_writes(&self) -> usize {
        self.inner.lock().unwrap().total_writes
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    fn run(&self, line: &str, input: Option<Vec<u8>>) -> (CommandOutput, Option<Arc<dyn TaskStore>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(line.to_string());
        let words = shell_words(line);
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["mkdir", "-p", "--", dir] => {
                if inner.deny_mkdir.iter().any(|p| dir.starts_with(p.as_str())) {
                    return (
                        fail(format!(
                            "mkdir: cannot create directory '{dir}': Permission denied"
                        )),
                        None,
                    );
                }
                let mut current = dir.trim_end_matches('/').to_string();
                while !current.is_empty() && current != "/" {
                    inner.dirs.insert(current.clone());
                    current = parent(&current).to_string();
                }
                (ok(""), None)
            }
            ["stat", "-c", "%s %Y", "--", path, "2>/dev/null", "||", "echo", sentinel] => {
                match inner.files.get(*path) {
                    Some(file) => (ok(format!("{} {}\n", file.data.len(), file.mtime)), None),
                    None => (ok(format!("{sentinel}\n")), None),
                }
            }
            ["cat", ">", path] => {
                let path = path.to_string();
                *inner.writes.entry(path.clone()).or_default() += 1;
                if !inner.dirs.contains(parent(&path)) {
                    return (
                        fail(format!("bash: {path}: No such file or directory")),
                        None,
                    );
                }
                if let Some(remaining) = inner.transient_failures.get_mut(&path) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return (fail("client_loop: send disconnect: Broken pipe, connection reset"), None);
                    }
                }
                let mut data = input.unwrap_or_default();
                if inner.truncate.contains(&path) {
                    data.truncate(data.len() / 2);
                }
                if !inner.discard.contains(&path) {
                    inner.files.insert(
                        path,
                        RemoteFile {
                            data,
                            mtime: now_secs(),
                        },
                    );
                }
                inner.total_writes += 1;
                if let Some((after, token)) = &inner.cancel_after {
                    if inner.total_writes >= *after {
                        token.cancel();
                    }
                }
                let trigger = match &inner.pause_after {
                    Some((after, _)) => inner.total_writes >= *after,
                    None => false,
                };
                let store = if trigger {
                    inner.pause_after.take().map(|(_, store)| store)
                } else {
                    None
                };
                (ok(""), store)
            }
            ["touch", "-c", "-m", "-d", stamp, "--", path] => {
                let Some(secs) = stamp.strip_prefix('@').and_then(|s| s.parse::<i64>().ok()) else {
                    return (fail(format!("touch: invalid date format '{stamp}'")), None);
                };
                if let Some(file) = inner.files.get_mut(*path) {
                    file.mtime = secs;
                }
                (ok(""), None)
            }
            ["echo", marker] => (ok(format!("{marker}\n")), None),
            _ => (fail(format!("sh: unsupported command: {line}")), None),
        }
    }
}

#[async_trait]
impl RemoteShell for FakeRemote {
    async fn exec(&self, command: &str) -> sitepush::Result<CommandOutput> {
        let words = shell_words(command);
        if words.first().map(String::as_str) == Some("stat") {
            let delay = self.inner.lock().unwrap().stat_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(path) = words.get(4) {
                let mut inner = self.inner.lock().unwrap();
                if let Some(remaining) = inner.stat_errors.get_mut(path) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        inner.commands.push(command.to_string());
                        return Err(DeployError::Connection("channel closed".to_string()));
                    }
                }
            }
        }
        Ok(self.run(command, None).0)
    }

    async fn exec_with_input(
        &self,
        command: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        _io_size: usize,
    ) -> sitepush::Result<CommandOutput> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;
        let (output, pause) = self.run(command, Some(data));
        if let Some(store) = pause {
            store.set_paused(true).await?;
        }
        Ok(output)
    }

    async fn check(&self) -> sitepush::Result<()> {
        Ok(())
    }

    async fn close(&self) -> sitepush::Result<()> {
        Ok(())
    }
}

/// Per-connection handle so the session manager owns its only reference
struct FakeHandle(Arc<FakeRemote>);

#[async_trait]
impl RemoteShell for FakeHandle {
    async fn exec(&self, command: &str) -> sitepush::Result<CommandOutput> {
        self.0.exec(command).await
    }

    async fn exec_with_input(
        &self,
        command: &str,
        input: &mut (dyn AsyncRead + Send + Unpin),
        io_size: usize,
    ) -> sitepush::Result<CommandOutput> {
        self.0.exec_with_input(command, input, io_size).await
    }

    async fn check(&self) -> sitepush::Result<()> {
        self.0.check().await
    }

    async fn close(&self) -> sitepush::Result<()> {
        self.0.close().await
    }
}

pub struct FakeConnector {
    remote: Arc<FakeRemote>,
    refuse: bool,
    pub opened: AtomicUsize,
}

impl FakeConnector {
    pub fn new(remote: Arc<FakeRemote>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            refuse: false,
            opened: AtomicUsize::new(0),
        })
    }

    pub fn refusing(remote: Arc<FakeRemote>) -> Arc<Self> {
        Arc::new(Self {
            remote,
            refuse: true,
            opened: AtomicUsize::new(0),
        })
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(
        &self,
        profile: &ServerProfile,
        _config: &DeployConfig,
    ) -> sitepush::Result<SshSessionManager> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(DeployError::Connection(format!(
                "dial tcp {}: connection refused",
                profile.address()
            )));
        }
        Ok(SshSessionManager::from_shell(Arc::new(FakeHandle(Arc::clone(
            &self.remote,
        )))))
    }
}

/// Task store counting completions per id
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryTaskStore,
    completions: Mutex<HashMap<String, usize>>,
}

impl CountingStore {
    pub fn max_completions(&self) -> usize {
        self.completions
            .lock()
            .unwrap()
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    pub fn completed_ids(&self) -> usize {
        self.completions.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskStore for CountingStore {
    async fn list_pending(&self) -> Result<Vec<PersistedTask>, anyhow::Error> {
        self.inner.list_pending().await
    }

    async fn replace_all(&self, tasks: Vec<PersistedTask>) -> Result<(), anyhow::Error> {
        self.inner.replace_all(tasks).await
    }

    async fn mark_completed(&self, id: &str) -> Result<(), anyhow::Error> {
        *self
            .completions
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default() += 1;
        self.inner.mark_completed(id).await
    }

    async fn remove_completed(&self) -> Result<(), anyhow::Error> {
        self.inner.remove_completed().await
    }

    async fn is_paused(&self) -> Result<bool, anyhow::Error> {
        self.inner.is_paused().await
    }

    async fn set_paused(&self, paused: bool) -> Result<(), anyhow::Error> {
        self.inner.set_paused(paused).await
    }
}

/// Keeps every reported event
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn profile() -> ServerProfile {
    let mut profile = ServerProfile::with_key("deploy.example.com", "www", "/keys/id_ed25519", REMOTE_ROOT);
    profile.id = Some("srv-1".to_string());
    profile.name = Some("primary".to_string());
    profile
}

pub fn test_config(workers: usize) -> DeployConfig {
    DeployConfig {
        workers,
        retry_delay_ms: 0,
        ..Default::default()
    }
}

pub fn engine(
    remote: &Arc<FakeRemote>,
    store: Arc<dyn TaskStore>,
    progress: Arc<dyn ProgressSink>,
    workers: usize,
) -> DeployEngine {
    DeployEngine::new(
        FakeConnector::new(Arc::clone(remote)),
        store,
        progress,
        test_config(workers),
    )
}

/// Writes `files` under a fresh temp dir with a fixed modification time
pub fn site(files: &[(&str, &[u8])]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (relative, data) in files {
        write_local(dir.path(), relative, data);
    }
    dir
}

pub fn write_local(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, data).unwrap();
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(LOCAL_MTIME))
        .unwrap();
}

pub fn remote(relative: &str) -> String {
    format!("{REMOTE_ROOT}/{relative}")
}
