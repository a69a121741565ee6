// ===============================
// src/toast.rs (single-slot notifications)
// ===============================
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::domain::{Severity, ToastMessage};
use crate::metrics::TOASTS;

type Slot = watch::Sender<Option<ToastMessage>>;

/// At most one message is shown; a new one preempts it.
#[derive(Clone)]
pub struct ToastQueue {
    slot: Arc<Slot>,
    next_id: Arc<AtomicU64>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Default for ToastQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ToastQueue {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { slot: Arc::new(tx), next_id: Arc::new(AtomicU64::new(1)), timer: Arc::default() }
    }

    pub fn current(&self) -> Option<ToastMessage> {
        self.slot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ToastMessage>> {
        self.slot.subscribe()
    }

    /// Replace whatever is shown and arm its auto-dismiss. Returns the message id.
    pub fn enqueue(&self, text: impl Into<String>, severity: Severity, lifetime: Duration) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let msg = ToastMessage { id, text: text.into(), severity, lifetime };
        TOASTS.with_label_values(&[severity.as_str()]).inc();
        info!(id, severity = severity.as_str(), text = %msg.text, "toast");

        let mut timer = self.timer.lock();
        if let Some(old) = timer.take() {
            old.abort();
        }
        self.slot.send_replace(Some(msg));

        let slot = Arc::clone(&self.slot);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            clear_if(&slot, id);
        }));
        id
    }

    pub fn success(&self, text: impl Into<String>, lifetime: Duration) -> u64 {
        self.enqueue(text, Severity::Success, lifetime)
    }

    pub fn error(&self, text: impl Into<String>, lifetime: Duration) -> u64 {
        self.enqueue(text, Severity::Error, lifetime)
    }

    /// Clear now. Safe to call with nothing shown.
    pub fn dismiss(&self) {
        if let Some(t) = self.timer.lock().take() {
            t.abort();
        }
        self.slot.send_if_modified(|cur| cur.take().is_some());
    }
}

// only the message that armed the timer may be cleared by it
fn clear_if(slot: &Slot, id: u64) {
    slot.send_if_modified(|cur| match cur {
        Some(m) if m.id == id => {
            *cur = None;
            true
        }
        _ => false,
    });
}
