// ===============================
// src/engine.rs (cache -> normalize -> publish)
// ===============================
//
// TraderSync is the actor: it alone applies snapshots, feeds the detector
// and drives the poll scheduler, one command at a time.
// SyncHandle is what consumers hold: snapshot/busy/toast watches plus the
// remote operations. Everything stops on shutdown(); late results are dropped.
//
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::config::{ApiPaths, Settings, Timing};
use crate::detector::{toast_text, TradeDetector};
use crate::domain::{ModelState, PerformanceData, Prediction, Snapshot, StartRequest, Trade};
use crate::error::ApiError;
use crate::metrics::{POLLS, POLL_FAILURES, POSITIONS, TRADING_LIVE};
use crate::normalize::{
    normalize_model_state, normalize_performance, normalize_prediction, normalize_status,
    normalize_trades,
};
use crate::scheduler::{PollScheduler, Tick};
use crate::tasks::{TaskGuard, TaskKind, TaskTracker};
use crate::toast::ToastQueue;
use crate::transport::Transport;

pub const MSG_STARTED: &str = "Live trading started successfully!";
pub const MSG_STOPPED: &str = "Trading has been stopped.";
pub const MSG_REFRESHED: &str = "Data refreshed.";
pub const MSG_FETCH_FAILED: &str = "Failed to fetch latest data.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollKind { Initial, Manual, Tick }
impl PollKind {
    fn as_str(&self) -> &'static str {
        match self { PollKind::Initial => "initial", PollKind::Manual => "manual", PollKind::Tick => "tick" }
    }
}

enum Command {
    Poll { reply: oneshot::Sender<Result<Snapshot, ApiError>> },
    Publish { snapshot: Snapshot, reply: oneshot::Sender<()> },
}

struct Core {
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    paths: ApiPaths,
    timing: Timing,
    snapshot: watch::Sender<Snapshot>,
    tasks: TaskTracker,
    toasts: ToastQueue,
    cancel: CancellationToken,
}

impl Core {
    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T, ApiError>>) -> Result<T, ApiError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ApiError::Cancelled),
            r = fut => r,
        }
    }

    fn invalidate_status(&self) {
        for key in [&self.paths.status, &self.paths.trade_history, &self.paths.model_state] {
            self.cache.invalidate(key);
        }
    }

    fn report(&self, op: &'static str, e: &ApiError) {
        if *e == ApiError::Cancelled {
            debug!(op, "dropped after shutdown");
            return;
        }
        error!(op, kind = e.kind(), error = %e, "operation failed");
        self.toasts.error(e.to_string(), self.timing.toast_system);
    }
}

/// The sync actor. Built and started by [`TraderSync::spawn`].
pub struct TraderSync {
    core: Arc<Core>,
    detector: TradeDetector,
    scheduler: PollScheduler,
    ticks_tx: mpsc::Sender<Tick>,
    ticks: mpsc::Receiver<Tick>,
    commands: mpsc::Receiver<Command>,
}

impl TraderSync {
    /// Start the actor (initial status load included) and hand back a consumer handle.
    pub fn spawn(transport: Arc<dyn Transport>, settings: &Settings) -> SyncHandle {
        let cancel = CancellationToken::new();
        let (snapshot, _) = watch::channel(Snapshot::pending());
        let core = Arc::new(Core {
            cache: ResponseCache::new(Arc::clone(&transport), settings.timing.status_cache_ttl),
            transport,
            paths: settings.paths.clone(),
            timing: settings.timing.clone(),
            snapshot,
            tasks: TaskTracker::new(),
            toasts: ToastQueue::new(),
            cancel: cancel.clone(),
        });

        let (cmd_tx, commands) = mpsc::channel(16);
        // capacity 1: ticks arriving while a poll is queued coalesce
        let (ticks_tx, ticks) = mpsc::channel(1);
        let actor = TraderSync {
            core: Arc::clone(&core),
            detector: TradeDetector::new(),
            scheduler: PollScheduler::new(settings.timing.poll_interval, cancel.child_token()),
            ticks_tx,
            ticks,
            commands,
        };

        let loading = core.tasks.begin(TaskKind::InitialLoad);
        tokio::spawn(actor.run(loading));
        SyncHandle { core, commands: cmd_tx }
    }

    async fn run(mut self, loading: TaskGuard) {
        let _ = self.poll(PollKind::Initial).await;
        drop(loading);

        let cancel = self.core.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Poll { reply }) => {
                        let r = self.poll(PollKind::Manual).await;
                        let _ = reply.send(r);
                    }
                    Some(Command::Publish { snapshot, reply }) => {
                        self.apply(snapshot);
                        let _ = reply.send(());
                    }
                    // every handle is gone
                    None => break,
                },
                Some(tick) = self.ticks.recv() => {
                    if !self.scheduler.is_current(&tick) {
                        debug!(timer = tick.timer, seq = tick.seq, "stale tick dropped");
                        continue;
                    }
                    debug!(timer = tick.timer, seq = tick.seq, "poll tick");
                    let _ = self.poll(PollKind::Tick).await;
                }
            }
        }
        self.scheduler.stop();
        info!("sync engine stopped");
    }

    async fn poll(&mut self, kind: PollKind) -> Result<Snapshot, ApiError> {
        let core = Arc::clone(&self.core);
        let read = core
            .cancellable(async {
                let raw = core.cache.get(&core.paths.status).await?;
                Ok(normalize_status(&raw))
            })
            .await;

        match read {
            Ok(snapshot) => {
                POLLS.inc();
                debug!(kind = kind.as_str(), state = snapshot.trading_state.as_str(), positions = snapshot.positions.len(), "status read");
                self.apply(snapshot.clone());
                Ok(snapshot)
            }
            Err(ApiError::Cancelled) => Err(ApiError::Cancelled),
            Err(e) => {
                POLL_FAILURES.inc();
                warn!(kind = kind.as_str(), error = %e, "status read failed, falling back to STOPPED");
                self.core.toasts.error(MSG_FETCH_FAILED, self.core.timing.toast_system);
                self.apply(Snapshot::stopped());
                Err(e)
            }
        }
    }

    fn apply(&mut self, snapshot: Snapshot) {
        if self.core.cancel.is_cancelled() {
            debug!("snapshot arrived after shutdown, ignored");
            return;
        }
        TRADING_LIVE.set(snapshot.trading_state.is_live() as i64);
        POSITIONS.set(snapshot.positions.len() as i64);

        if let Some(ev) = self.detector.observe(&snapshot) {
            self.core.toasts.success(toast_text(&ev), self.core.timing.toast_detector);
        }
        self.scheduler.sync_with(snapshot.trading_state, &self.ticks_tx);
        self.core.snapshot.send_replace(snapshot);
    }
}

/// Consumer side of the engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncHandle {
    core: Arc<Core>,
    commands: mpsc::Sender<Command>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.core.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.core.snapshot.borrow().clone()
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.core.tasks
    }

    pub fn toasts(&self) -> &ToastQueue {
        &self.core.toasts
    }

    pub fn shutdown(&self) {
        if !self.core.cancel.is_cancelled() {
            info!("shutting down sync engine");
        }
        self.core.cancel.cancel();
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ApiError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ApiError::Cancelled)?;
        self.core.cancellable(async { rx.await.map_err(|_| ApiError::Cancelled) }).await
    }

    fn finish<T>(&self, op: &'static str, result: Result<T, ApiError>, ok_msg: Option<&str>) -> Result<T, ApiError> {
        match &result {
            Ok(_) => {
                if let Some(msg) = ok_msg {
                    self.core.toasts.success(msg, self.core.timing.toast_system);
                }
            }
            Err(e) => self.core.report(op, e),
        }
        result
    }

    /// Status read through the cache; failure publishes STOPPED and is returned.
    pub async fn refresh(&self) -> Result<Snapshot, ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::Refresh);
        let snapshot = self.request(|reply| Command::Poll { reply }).await??;
        self.core.toasts.success(MSG_REFRESHED, self.core.timing.toast_system);
        Ok(snapshot)
    }

    pub async fn start(&self, req: &StartRequest) -> Result<Snapshot, ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::Start);
        let result = async {
            let body = serde_json::to_value(req)?;
            self.core.cancellable(self.core.transport.post(&self.core.paths.start, Some(body))).await?;
            info!(symbols = ?req.symbols, "live trading started");
            self.core.invalidate_status();
            // a failed read has already published STOPPED and raised its own toast
            let snapshot = match self.request(|reply| Command::Poll { reply }).await? {
                Ok(snapshot) => snapshot,
                Err(_) => self.snapshot(),
            };
            Ok::<_, ApiError>(snapshot)
        }
        .await;
        self.finish("start", result, Some(MSG_STARTED))
    }

    pub async fn stop(&self) -> Result<(), ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::Stop);
        let result = async {
            self.core.cancellable(self.core.transport.post(&self.core.paths.stop, None)).await?;
            info!("live trading stopped");
            self.core.invalidate_status();
            self.request(|reply| Command::Publish { snapshot: Snapshot::stopped(), reply }).await
        }
        .await;
        self.finish("stop", result, Some(MSG_STOPPED))
    }

    pub async fn trade_history(&self) -> Result<Vec<Trade>, ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::TradeHistory);
        let result = self
            .core
            .cancellable(self.core.cache.get(&self.core.paths.trade_history))
            .await
            .map(|raw| normalize_trades(&raw));
        self.finish("trade_history", result, None)
    }

    /// Never cached: metrics are rebuilt on every call.
    pub async fn performance(&self) -> Result<PerformanceData, ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::Performance);
        let result = self
            .core
            .cancellable(self.core.transport.get(&self.core.paths.performance))
            .await
            .and_then(|raw| normalize_performance(&raw));
        self.finish("performance", result, None)
    }

    pub async fn predict(&self, symbol: &str) -> Result<Prediction, ApiError> {
        let _busy = self.core.tasks.begin(TaskKind::Prediction);
        let body = json!({ "symbol": symbol });
        let result = self
            .core
            .cancellable(self.core.transport.post(&self.core.paths.predict, Some(body)))
            .await
            .map(|raw| normalize_prediction(&raw));
        self.finish("predict", result, None)
    }

    /// Background read; failures are logged, not toasted.
    pub async fn model_state(&self) -> Result<ModelState, ApiError> {
        let result = self
            .core
            .cancellable(self.core.cache.get(&self.core.paths.model_state))
            .await
            .map(|raw| normalize_model_state(&raw));
        if let Err(e) = &result {
            if *e != ApiError::Cancelled {
                warn!(error = %e, "model state read failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::FakeTransport;
    use crate::config::ApiSettings;
    use crate::domain::{Severity, TradingState, TraderConfig};
    use std::time::Duration;
    use url::Url;

    const POLL: Duration = Duration::from_secs(300);

    fn settings() -> Settings {
        Settings {
            api: ApiSettings {
                base_url: Url::parse("http://localhost:8000").unwrap(),
                api_key: Some("k".into()),
                request_timeout: Duration::from_secs(30),
            },
            paths: ApiPaths::default(),
            timing: Timing { poll_interval: POLL, ..Timing::default() },
            metrics_port: None,
        }
    }

    fn live(points: u64) -> serde_json::Value {
        json!({
            "status": "running",
            "total_trades": points,
            "position_details": { "positions_by_symbol": [{ "symbol": "NVDA", "shares": 3, "entry_price": 120.0 }] }
        })
    }

    fn stopped() -> serde_json::Value {
        json!({ "status": "stopped", "is_trading": false })
    }

    async fn loaded(rx: &mut watch::Receiver<Snapshot>) -> Snapshot {
        rx.wait_for(|s| s.trading_state != TradingState::Pending).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_publishes_and_clears_flag() {
        let t = Arc::new(FakeTransport::new(live(2)).with_delay(Duration::from_millis(100)));
        let h = TraderSync::spawn(t.clone(), &settings());
        assert_eq!(h.snapshot().trading_state, TradingState::Pending);
        assert!(h.tasks().is_busy(TaskKind::InitialLoad));

        let s = loaded(&mut h.subscribe()).await;
        assert_eq!(s.trading_state, TradingState::Live);
        assert_eq!(s.positions[0].symbol, "NVDA");
        tokio::task::yield_now().await;
        assert!(!h.tasks().is_busy(TaskKind::InitialLoad));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_load_degrades_to_stopped() {
        let t = Arc::new(FakeTransport::new(live(0)));
        t.push(Err(ApiError::Transport("connection refused".into())));
        let h = TraderSync::spawn(t.clone(), &settings());

        let s = loaded(&mut h.subscribe()).await;
        assert_eq!(s, Snapshot::stopped());
        let toast = h.toasts().current().unwrap();
        assert_eq!((toast.text.as_str(), toast.severity), (MSG_FETCH_FAILED, Severity::Error));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn live_trader_is_polled_and_new_trades_toasted() {
        let t = Arc::new(FakeTransport::new(live(0)));
        let h = TraderSync::spawn(t.clone(), &settings());
        let mut rx = h.subscribe();
        loaded(&mut rx).await;
        assert_eq!(t.get_count(), 1);

        t.set_fallback(Ok(live(3)));
        tokio::time::sleep(POLL + Duration::from_secs(1)).await;
        assert_eq!(t.get_count(), 2);
        assert_eq!(h.snapshot().decision_points(), Some(3));
        let toast = h.toasts().current().unwrap();
        assert_eq!(toast.text, "3 new trades executed");
        assert_eq!(toast.lifetime, Duration::from_secs(3));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_trader_is_not_polled() {
        let t = Arc::new(FakeTransport::new(stopped()));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        tokio::time::sleep(POLL * 3).await;
        assert_eq!(t.get_count(), 1);
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_within_ttl_reuses_cached_status() {
        let t = Arc::new(FakeTransport::new(live(1)));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        let s = h.refresh().await.unwrap();
        assert_eq!(s.trading_state, TradingState::Live);
        assert_eq!(t.get_count(), 1);
        assert_eq!(h.toasts().current().unwrap().text, MSG_REFRESHED);
        assert!(!h.tasks().is_busy(TaskKind::Refresh));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn start_flag_spans_the_call_on_success_and_failure() {
        let t = Arc::new(FakeTransport::new(stopped()).with_delay(Duration::from_millis(50)));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;
        let req = StartRequest { symbols: vec!["NVDA".into()], config: TraderConfig::recommended() };

        for fail in [false, true] {
            if fail {
                t.set_post_reply(Err(ApiError::Status { status: 400, body: "symbols required".into() }));
            } else {
                t.set_fallback(Ok(live(0)));
            }
            assert!(!h.tasks().is_busy(TaskKind::Start));
            let call = {
                let (h, req) = (h.clone(), req.clone());
                tokio::spawn(async move { h.start(&req).await })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(h.tasks().is_busy(TaskKind::Start));

            let r = call.await.unwrap();
            assert!(!h.tasks().is_busy(TaskKind::Start));
            let toast = h.toasts().current().unwrap();
            if fail {
                assert_eq!(r.unwrap_err(), ApiError::Status { status: 400, body: "symbols required".into() });
                assert_eq!(toast.severity, Severity::Error);
                assert_eq!(toast.text, "API Error: 400 - symbols required");
            } else {
                // cache was invalidated, so the follow-up read sees the live trader
                assert_eq!(r.unwrap().trading_state, TradingState::Live);
                assert_eq!(toast.text, MSG_STARTED);
            }
        }
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_publishes_stopped_and_cancels_polling() {
        let t = Arc::new(FakeTransport::new(live(1)));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        h.stop().await.unwrap();
        assert_eq!(h.snapshot(), Snapshot::stopped());
        assert_eq!(h.toasts().current().unwrap().text, MSG_STOPPED);

        tokio::time::sleep(POLL * 2).await;
        assert_eq!(t.get_count(), 1);
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn tick_queued_behind_stop_is_dropped() {
        use tokio::time::{sleep_until, Instant};

        let t = Arc::new(FakeTransport::new(live(1)).with_delay(Duration::from_secs(1)));
        let t0 = Instant::now();
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        // timer armed at t0+1s, first tick due at t0+301s. The refresh keeps
        // the actor busy across that tick while the stop lands behind it.
        sleep_until(t0 + POLL + Duration::from_millis(200)).await;
        let stop = {
            let h = h.clone();
            tokio::spawn(async move { h.stop().await })
        };
        sleep_until(t0 + POLL + Duration::from_millis(500)).await;
        let refresh = {
            let h = h.clone();
            tokio::spawn(async move { h.refresh().await })
        };
        stop.await.unwrap().unwrap();
        refresh.await.unwrap().unwrap();
        let reads = t.get_count();

        tokio::time::sleep(POLL + Duration::from_secs(5)).await;
        assert_eq!(h.snapshot(), Snapshot::stopped());
        assert_eq!(t.get_count(), reads);
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn reads_share_the_status_resource() {
        let t = Arc::new(FakeTransport::new(serde_json::from_str(include_str!("../tests/fixtures/status_v2_positions_list.json")).unwrap()));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        let trades = h.trade_history().await.unwrap();
        assert_eq!(trades.len(), 2);
        let ms = h.model_state().await.unwrap();
        assert_eq!(ms.last_prediction.unwrap().action, "SELL");
        assert_eq!(t.get_count(), 1);
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn performance_is_never_cached() {
        let t = Arc::new(FakeTransport::new(live(0)));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        h.performance().await.unwrap();
        h.performance().await.unwrap();
        assert_eq!(t.get_count(), 3);
        assert!(!h.tasks().is_busy(TaskKind::Performance));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_performance_raises_error_toast() {
        let t = Arc::new(FakeTransport::new(stopped()));
        let h = TraderSync::spawn(t.clone(), &settings());
        loaded(&mut h.subscribe()).await;

        assert_eq!(h.performance().await.unwrap_err(), ApiError::TradingInactive);
        assert_eq!(h.toasts().current().unwrap().text, "Trading not active");
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn predict_normalizes_reply() {
        let t = Arc::new(FakeTransport::new(stopped()));
        t.set_post_reply(Ok(json!({ "action_type": "BUY", "confidence": 0.8, "market_regime": "bull" })));
        let h = TraderSync::spawn(t.clone(), &settings());

        let p = h.predict("NVDA").await.unwrap();
        assert_eq!(p.action, "BUY");
        assert_eq!(p.meta.unwrap().regime.as_deref(), Some("bull"));
        assert!(!h.tasks().is_busy(TaskKind::Prediction));
        h.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drops_in_flight_results() {
        let t = Arc::new(FakeTransport::new(live(5)).with_delay(Duration::from_secs(2)));
        let h = TraderSync::spawn(t.clone(), &settings());

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.shutdown();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.snapshot().trading_state, TradingState::Pending);
        assert!(!h.tasks().is_busy(TaskKind::InitialLoad));
        assert_eq!(h.refresh().await.unwrap_err(), ApiError::Cancelled);
        assert!(h.toasts().current().is_none());
    }
}
