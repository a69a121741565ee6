// ===============================
// src/tasks.rs (busy flags for UI gating)
// ===============================
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::metrics::TASK_BUSY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    InitialLoad,
    Start,
    Stop,
    Refresh,
    TradeHistory,
    Performance,
    Prediction,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::InitialLoad,
        TaskKind::Start,
        TaskKind::Stop,
        TaskKind::Refresh,
        TaskKind::TradeHistory,
        TaskKind::Performance,
        TaskKind::Prediction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::InitialLoad => "initial_load",
            TaskKind::Start => "start",
            TaskKind::Stop => "stop",
            TaskKind::Refresh => "refresh",
            TaskKind::TradeHistory => "trade_history",
            TaskKind::Performance => "performance",
            TaskKind::Prediction => "prediction",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusyFlags([bool; 7]);

impl BusyFlags {
    pub fn is_busy(&self, kind: TaskKind) -> bool {
        self.0[kind.index()]
    }
    pub fn any(&self) -> bool {
        self.0.iter().any(|b| *b)
    }
}

/// Shared handle; clones observe and flip the same flags.
#[derive(Clone)]
pub struct TaskTracker {
    tx: Arc<watch::Sender<BusyFlags>>,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BusyFlags::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn flags(&self) -> BusyFlags {
        *self.tx.borrow()
    }

    pub fn is_busy(&self, kind: TaskKind) -> bool {
        self.flags().is_busy(kind)
    }

    pub fn subscribe(&self) -> watch::Receiver<BusyFlags> {
        self.tx.subscribe()
    }

    /// Raise the flag; it drops back when the guard goes out of scope,
    /// whatever way the operation ends.
    pub fn begin(&self, kind: TaskKind) -> TaskGuard {
        self.set(kind, true);
        TaskGuard { tracker: self.clone(), kind }
    }

    fn set(&self, kind: TaskKind, busy: bool) {
        self.tx.send_modify(|f| f.0[kind.index()] = busy);
        TASK_BUSY.with_label_values(&[kind.as_str()]).set(busy as i64);
        debug!(task = kind.as_str(), busy, "task flag");
    }
}

#[must_use = "the flag resets as soon as the guard is dropped"]
pub struct TaskGuard {
    tracker: TaskTracker,
    kind: TaskKind,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.set(self.kind, false);
    }
}
