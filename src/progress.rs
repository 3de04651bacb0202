use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Broad category of a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Build,
    Deploy,
    Complete,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Building,
    Deploying,
    Success,
    Failed,
    Paused,
}

/// One state change of a deployment run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub status: Status,
    pub message: String,
    /// Percentage 0-100
    pub progress: u8,
    pub total: usize,
    pub current: usize,
    pub current_file: Option<String>,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, status: Status, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            progress: 0,
            total: 0,
            current: 0,
            current_file: None,
            server_id: None,
            server_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets counts and derives the percentage from them
    pub fn counts(mut self, current: usize, total: usize) -> Self {
        self.current = current;
        self.total = total;
        self.progress = percentage(current, total);
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.current_file = Some(file.into());
        self
    }

    pub fn server(mut self, id: Option<&str>, name: Option<&str>) -> Self {
        self.server_id = id.map(str::to_string);
        self.server_name = name.map(str::to_string);
        self
    }
}

fn percentage(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((current.min(total) as f64 / total as f64) * 100.0) as u8
}

/// Receives progress events; fire-and-forget from the engine's side
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Logs every event through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn report(&self, event: ProgressEvent) {
        let file = event.current_file.as_deref().unwrap_or("");
        match event.status {
            Status::Failed => error!(
                progress = event.progress,
                current = event.current,
                total = event.total,
                current_file = file,
                "{}",
                event.message
            ),
            Status::Paused => warn!(
                current = event.current,
                total = event.total,
                "{}",
                event.message
            ),
            _ => info!(
                progress = event.progress,
                current = event.current,
                total = event.total,
                current_file = file,
                "{}",
                event.message
            ),
        }
    }
}

/// Fans events out to any number of subscribers, e.g. websocket clients
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastProgress {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl ProgressSink for BroadcastProgress {
    fn report(&self, event: ProgressEvent) {
        // No subscribers is not an error for the engine
        let _ = self.tx.send(event);
    }
}
