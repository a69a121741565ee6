// ===============================
// src/scheduler.rs (poll timer, Active <-> Idle)
// ===============================
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::TradingState;
use crate::metrics::POLL_TIMERS;

/// One timer firing. `timer` numbers the timer that fired it (1-based),
/// `seq` restarts at 1 for every timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub timer: u64,
    pub seq: u64,
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

struct Timer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns at most one repeating poll timer.
pub struct PollScheduler {
    interval: Duration,
    parent: CancellationToken,
    timer: Option<Timer>,
    started: u64,
}

impl PollScheduler {
    /// Zero would make the timer task panic; it is clamped to 1 ms.
    pub fn new(interval: Duration, parent: CancellationToken) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        Self { interval, parent, timer: None, started: 0 }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.handle.is_finished())
    }

    /// Total timers started over the scheduler's life.
    pub fn timers_started(&self) -> u64 {
        self.started
    }

    /// A tick may sit in the queue after its timer was stopped or replaced;
    /// only ticks of the running timer should trigger a poll.
    pub fn is_current(&self, tick: &Tick) -> bool {
        self.is_running() && tick.timer == self.started
    }

    /// Start the timer. No-op (false) when one is already running.
    pub fn start(&mut self, tx: mpsc::Sender<Tick>) -> bool {
        if self.is_running() {
            return false;
        }
        self.stop();

        self.started += 1;
        let timer = self.started;
        let token = self.parent.child_token();
        let period = self.interval;
        let cancel = token.clone();
        let handle = tokio::spawn(async move {
            // first tick one full period out; the caller just polled
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        seq += 1;
                        match tx.try_send(Tick { timer, seq }) {
                            Ok(()) => {}
                            // a poll is already queued; this tick folds into it
                            Err(TrySendError::Full(_)) => debug!(seq, "poll already queued, tick coalesced"),
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                }
            }
        });

        POLL_TIMERS.inc();
        info!(timer, interval_secs = period.as_secs_f64(), "poll timer started");
        self.timer = Some(Timer { token, handle });
        true
    }

    /// Cancel the timer if any. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        match self.timer.take() {
            Some(t) => {
                t.token.cancel();
                t.handle.abort();
                info!("poll timer stopped");
                true
            }
            None => false,
        }
    }

    /// Live -> timer running, anything else -> no timer.
    pub fn sync_with(&mut self, state: TradingState, tx: &mpsc::Sender<Tick>) {
        if state.is_live() {
            self.start(tx.clone());
        } else {
            self.stop();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Some(t) = self.timer.take() {
            t.token.cancel();
            t.handle.abort();
        }
    }
}
