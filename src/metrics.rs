// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{debug, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- API traffic --------
pub static API_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("api_requests_total", "trader API requests (labels: method, outcome)"),
        &["method", "outcome"],
    )
    .unwrap()
});

// Round trip per request (milliseconds)
pub static API_LATENCY_MS: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "api_request_latency_ms",
        "trader API round trip (ms)",
    ))
    .unwrap()
});

// -------- Response cache --------
pub static CACHE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("cache_events_total", "response cache decisions (hit, miss, joined, stale)"),
        &["event"],
    )
    .unwrap()
});

// -------- Sync loop --------
pub static POLLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("status_polls_total", "status reads applied").unwrap());

pub static POLL_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("status_poll_failures_total", "status reads degraded to STOPPED").unwrap());

pub static POLL_TIMERS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("poll_timers_started_total", "poll timers started").unwrap());

pub static TRADING_LIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("trading_live", "1 if the last snapshot was LIVE").unwrap());

pub static POSITIONS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_open", "positions in the last snapshot").unwrap());

pub static TRADE_EVENTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trade_events_total", "new-trade notifications raised").unwrap());

// -------- Consumer surface --------
pub static TOASTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("toasts_total", "toasts shown (label: severity)"), &["severity"])
        .unwrap()
});

pub static TASK_BUSY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("task_busy", "1 while an operation is in flight"), &["task"]).unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(API_REQUESTS.clone())),
        REGISTRY.register(Box::new(API_LATENCY_MS.clone())),
        REGISTRY.register(Box::new(CACHE_EVENTS.clone())),
        REGISTRY.register(Box::new(POLLS.clone())),
        REGISTRY.register(Box::new(POLL_FAILURES.clone())),
        REGISTRY.register(Box::new(POLL_TIMERS.clone())),
        REGISTRY.register(Box::new(TRADING_LIVE.clone())),
        REGISTRY.register(Box::new(POSITIONS.clone())),
        REGISTRY.register(Box::new(TRADE_EVENTS.clone())),
        REGISTRY.register(Box::new(TOASTS.clone())),
        REGISTRY.register(Box::new(TASK_BUSY.clone())),
    ] {
        match m {
            Ok(()) => {}
            // a second init() finds everything in place
            Err(prometheus::Error::AlreadyReg) => debug!("metric already registered"),
            Err(e) => warn!(error = %e, "metric registration failed"),
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics): tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(%addr, ?e, "metrics bind failed");
                return;
            }
        };
        tracing::info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => tracing::warn!(?e, "metrics accept error"),
            }
        }
    });
}
