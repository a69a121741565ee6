// ===============================
// src/main.rs
// ===============================
/*
 # watch the live trader (default), metrics on :9898
 API_BASE_URL=http://localhost:8000 API_KEY=... METRICS_PORT=9898 trader-sync

 # one-shot calls
 trader-sync start --preset top5-elite --recommended
 trader-sync performance
 curl -s localhost:9898/metrics | egrep '^(trading_live|positions_open|cache_events_total)'
*/
/*
=============================================================================
Project : live_trader_sync — status sync & normalization client for a
          remote RL trading service
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls the trader's status API, caches and normalizes the
          drifting response schema into one snapshot, raises toasts on
          new trades and tracks busy flags for user-triggered actions.
=============================================================================
*/
use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::sync::Arc;
use tokio::{select, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use live_trader_sync::config;
use live_trader_sync::domain::{Snapshot, StartRequest, SymbolPreset, TradingState, TraderConfig};
use live_trader_sync::metrics;
use live_trader_sync::transport::HttpTransport;
use live_trader_sync::{SyncHandle, TraderSync};

#[derive(Parser, Debug)]
#[command(name = "trader-sync", version, about = "Live view of the remote RL trader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Follow snapshots and toasts until Ctrl-C (default)
    Watch,
    /// Print the current snapshot
    Status,
    /// Start live trading
    Start(StartArgs),
    /// Stop live trading
    Stop,
    /// Recent trades
    History,
    /// Performance metrics (live sessions only)
    Performance,
    /// Ask the model for a decision on one symbol
    Predict { symbol: String },
    /// Last decision the model made
    ModelState,
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Comma separated, e.g. NVDA,AVGO
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    #[arg(long, value_enum)]
    preset: Option<SymbolPreset>,
    /// Pre-fill the config with the recommended tuning
    #[arg(long)]
    recommended: bool,

    #[arg(long)] initial_balance: Option<f64>,
    #[arg(long)] min_confidence: Option<f64>,
    #[arg(long)] max_risk: Option<f64>,
    #[arg(long)] max_position: Option<f64>,
    #[arg(long)] max_risk_per_trade: Option<f64>,
    #[arg(long)] max_positions: Option<f64>,
    #[arg(long)] max_drawdown: Option<f64>,
    #[arg(long)] position_limit: Option<f64>,
    #[arg(long)] risk_multiplier: Option<f64>,
    #[arg(long)] stop_loss: Option<f64>,
    #[arg(long)] take_profit: Option<f64>,
}

impl StartArgs {
    fn into_request(self) -> anyhow::Result<StartRequest> {
        let mut symbols = self.preset.map(|p| p.symbols()).unwrap_or_default();
        for s in self.symbols {
            let s = s.trim().to_ascii_uppercase();
            if !s.is_empty() && !symbols.contains(&s) {
                symbols.push(s);
            }
        }
        if symbols.is_empty() {
            bail!("no symbols: pass --symbols and/or --preset");
        }

        let base = if self.recommended { TraderConfig::recommended() } else { TraderConfig::default() };
        let config = TraderConfig {
            initial_balance: self.initial_balance.or(base.initial_balance),
            min_confidence: self.min_confidence.or(base.min_confidence),
            max_risk: self.max_risk.or(base.max_risk),
            max_position: self.max_position.or(base.max_position),
            max_risk_per_trade: self.max_risk_per_trade.or(base.max_risk_per_trade),
            max_positions: self.max_positions.or(base.max_positions),
            max_drawdown: self.max_drawdown.or(base.max_drawdown),
            position_limit: self.position_limit.or(base.position_limit),
            risk_multiplier: self.risk_multiplier.or(base.risk_multiplier),
            stop_loss: self.stop_loss.or(base.stop_loss),
            take_profit: self.take_profit.or(base.take_profit),
        };
        Ok(StartRequest { symbols, config })
    }
}

fn print_json<T: Serialize>(v: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn log_snapshot(s: &Snapshot) {
    let (value, pnl) = s.portfolio.as_ref().map(|p| (p.portfolio_value, p.total_pnl)).unwrap_or_default();
    info!(
        state = s.trading_state.as_str(),
        positions = s.positions.len(),
        portfolio_value = value,
        total_pnl = pnl,
        decision_points = ?s.decision_points(),
        "snapshot"
    );
}

async fn initial_snapshot(h: &SyncHandle) -> anyhow::Result<Snapshot> {
    let mut rx = h.subscribe();
    let s = rx
        .wait_for(|s| s.trading_state != TradingState::Pending)
        .await
        .context("sync engine stopped before the first status read")?;
    Ok(s.clone())
}

async fn watch(h: &SyncHandle) -> anyhow::Result<()> {
    let mut snapshots = h.subscribe();
    let mut toasts = h.toasts().subscribe();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(60));

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                return Ok(());
            },
            changed = snapshots.changed() => {
                if changed.is_err() { return Ok(()); }
                log_snapshot(&snapshots.borrow_and_update());
            },
            changed = toasts.changed() => {
                if changed.is_err() { return Ok(()); }
                if let Some(t) = toasts.borrow_and_update().as_ref() {
                    info!(severity = t.severity.as_str(), "{}", t.text);
                }
            },
            _ = heartbeat.tick() => {
                let s = h.snapshot();
                info!(state = s.trading_state.as_str(), busy = h.tasks().flags().any(), "heartbeat");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // ---- Load config ----
    let settings = config::load()?;
    info!(
        base_url = %settings.api.base_url,
        api_key = settings.api.api_key.is_some(),
        poll_secs = settings.timing.poll_interval.as_secs(),
        cache_ttl_ms = settings.timing.status_cache_ttl.as_millis() as u64,
        status_path = %settings.paths.status,
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = settings.metrics_port {
        metrics::serve_metrics(port);
    }

    // ---- Engine ----
    let transport = Arc::new(HttpTransport::new(&settings.api)?);
    let handle = TraderSync::spawn(transport, &settings);

    let outcome = match cli.command.unwrap_or(Cmd::Watch) {
        Cmd::Watch => watch(&handle).await,
        Cmd::Status => {
            let s = initial_snapshot(&handle).await?;
            print_json(&s)
        }
        Cmd::Start(args) => {
            let req = args.into_request()?;
            initial_snapshot(&handle).await?;
            let s = handle.start(&req).await?;
            print_json(&s)
        }
        Cmd::Stop => {
            initial_snapshot(&handle).await?;
            handle.stop().await?;
            print_json(&handle.snapshot())
        }
        Cmd::History => {
            let trades = handle.trade_history().await?;
            print_json(&trades)
        }
        Cmd::Performance => {
            let perf = handle.performance().await?;
            print_json(&perf)
        }
        Cmd::Predict { symbol } => {
            let p = handle.predict(&symbol.to_ascii_uppercase()).await?;
            print_json(&p)
        }
        Cmd::ModelState => {
            let ms = handle.model_state().await?;
            print_json(&ms)
        }
    };

    handle.shutdown();
    if let Err(e) = &outcome {
        warn!(error = %e, "command failed");
    }
    outcome
}
