// ===============================
// src/detector.rs
// ===============================
use tracing::info;

use crate::domain::{Snapshot, TradeEvent};
use crate::metrics::TRADE_EVENTS;

/// Watches the decision-point counter across snapshots.
/// The first live observation only sets the baseline.
#[derive(Debug, Default)]
pub struct TradeDetector {
    last: Option<u64>,
}

impl TradeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> Option<u64> {
        self.last
    }

    /// Non-live snapshots (and live ones without activity) are ignored.
    pub fn observe(&mut self, snapshot: &Snapshot) -> Option<TradeEvent> {
        if !snapshot.trading_state.is_live() {
            return None;
        }
        self.observe_count(snapshot.decision_points()?)
    }

    pub fn observe_count(&mut self, total: u64) -> Option<TradeEvent> {
        let prev = self.last.replace(total)?;
        if total <= prev {
            return None;
        }
        let ev = TradeEvent { delta: total - prev, total };
        TRADE_EVENTS.inc();
        info!(delta = ev.delta, total, "new trades detected");
        Some(ev)
    }
}

pub fn toast_text(ev: &TradeEvent) -> String {
    match ev.delta {
        1 => "1 new trade executed".to_string(),
        n => format!("{n} new trades executed"),
    }
}
