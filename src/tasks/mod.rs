//! Background workers and the status contract they report through.
//!
//! Scanning and clustering each run on their own thread. At most one task of
//! each type runs at a time; progress and completion flow one way to a
//! `StatusSink` supplied by the embedding application.

pub mod coordinator;
pub mod manager;

use std::sync::mpsc;

pub use coordinator::Coordinator;
pub use manager::{BackgroundTaskManager, TaskTicket};

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Type of background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    Scan,
    Cluster,
}

impl TaskType {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Scan => "Face Scan",
            TaskType::Cluster => "Face Clustering",
        }
    }
}

/// Receives status from the workers. Calls come from worker threads and
/// must not block.
pub trait StatusSink: Send + Sync {
    fn on_status(&self, message: &str);
    fn on_progress(&self, current: usize, total: usize);
    fn on_scan_complete(&self);
    fn on_cluster_complete(&self);
}

/// Status notifications as values, for channel-based consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Status(String),
    Progress { current: usize, total: usize },
    ScanComplete,
    ClusterComplete,
}

/// `StatusSink` that forwards every call over an mpsc channel. Sends to a
/// dropped receiver are ignored.
pub struct ChannelSink {
    tx: mpsc::Sender<StatusEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn on_status(&self, message: &str) {
        let _ = self.tx.send(StatusEvent::Status(message.to_string()));
    }

    fn on_progress(&self, current: usize, total: usize) {
        let _ = self.tx.send(StatusEvent::Progress { current, total });
    }

    fn on_scan_complete(&self) {
        let _ = self.tx.send(StatusEvent::ScanComplete);
    }

    fn on_cluster_complete(&self) {
        let _ = self.tx.send(StatusEvent::ClusterComplete);
    }
}

/// Log a status line and pass it to the sink.
pub(crate) fn report(sink: &dyn StatusSink, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!(status = %message);
    sink.on_status(message);
}

/// Like `report`, logged as a warning.
pub(crate) fn report_warning(sink: &dyn StatusSink, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::warn!(status = %message);
    sink.on_status(message);
}
