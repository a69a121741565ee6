// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : live_trader_sync — status sync & normalization client for a
          remote RL trading service
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Polls the trader's status API, caches and normalizes the
          drifting response schema into one snapshot, raises toasts on
          new trades and tracks busy flags for user-triggered actions.
=============================================================================
*/
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

/// Poll cadence while the trader is live
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CadenceMode {
    /// Matches the remote decision cadence (5 minutes).
    Decision,
    /// Fast refresh used by the earlier dashboard revision (5 seconds).
    Fast,
}

impl CadenceMode {
    pub fn from_env(key: &str, default_mode: CadenceMode) -> CadenceMode {
        Self::parse(&env::var(key).unwrap_or_default()).unwrap_or(default_mode)
    }

    pub fn parse(s: &str) -> Option<CadenceMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "decision" | "slow" => Some(CadenceMode::Decision),
            "fast" => Some(CadenceMode::Fast),
            _ => None,
        }
    }

    pub fn interval(&self) -> Duration {
        match self {
            CadenceMode::Decision => Duration::from_secs(300),
            CadenceMode::Fast => Duration::from_secs(5),
        }
    }
}

/// Endpoint paths. They moved between backend revisions, semantics did not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiPaths {
    pub status: String,
    pub start: String,
    pub stop: String,
    pub trade_history: String,
    pub performance: String,
    pub predict: String,
    pub model_state: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        // history & model state are served from the status payload on the current backend
        Self {
            status: "/api/v1/rl/live/status".into(),
            start: "/api/v1/rl/live/start".into(),
            stop: "/api/v1/rl/live/stop".into(),
            trade_history: "/api/v1/rl/live/status".into(),
            performance: "/api/v1/rl/state".into(),
            predict: "/api/v1/rl/predict".into(),
            model_state: "/api/v1/rl/live/status".into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApiSettings {
    pub base_url: Url,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timing {
    pub poll_interval: Duration,
    pub status_cache_ttl: Duration,
    pub toast_system: Duration,
    pub toast_detector: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            poll_interval: CadenceMode::Decision.interval(),
            status_cache_ttl: Duration::from_millis(5_000),
            toast_system: Duration::from_millis(4_000),
            toast_detector: Duration::from_millis(3_000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub api: ApiSettings,
    pub paths: ApiPaths,
    pub timing: Timing,
    pub metrics_port: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid API_BASE_URL {0:?}: {1}")]
    BaseUrl(String, url::ParseError),
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_path(key: &str, default: String) -> String {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
}

pub fn load() -> Result<Settings, ConfigError> {
    // .env first so everything below can come from it
    let _ = dotenv();

    // ===== API =====
    let raw_base = env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let base_url = Url::parse(&raw_base).map_err(|e| ConfigError::BaseUrl(raw_base.clone(), e))?;
    let api_key = env::var("API_KEY").ok().filter(|k| !k.trim().is_empty());
    let request_timeout = Duration::from_secs(env_u64("REQUEST_TIMEOUT_SECS").unwrap_or(30));

    // ===== Paths =====
    let d = ApiPaths::default();
    let paths = ApiPaths {
        status: env_path("STATUS_PATH", d.status),
        start: env_path("START_PATH", d.start),
        stop: env_path("STOP_PATH", d.stop),
        trade_history: env_path("TRADE_HISTORY_PATH", d.trade_history),
        performance: env_path("PERFORMANCE_PATH", d.performance),
        predict: env_path("PREDICT_PATH", d.predict),
        model_state: env_path("MODEL_STATE_PATH", d.model_state),
    };

    // ===== Timing =====
    // POLL_INTERVAL_SECS wins over POLL_CADENCE
    let cadence = CadenceMode::from_env("POLL_CADENCE", CadenceMode::Decision);
    let poll_interval = env_u64("POLL_INTERVAL_SECS")
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| cadence.interval());
    let dt = Timing::default();
    let timing = Timing {
        poll_interval,
        status_cache_ttl: env_u64("STATUS_CACHE_TTL_MS").map(Duration::from_millis).unwrap_or(dt.status_cache_ttl),
        toast_system: env_u64("TOAST_SYSTEM_MS").map(Duration::from_millis).unwrap_or(dt.toast_system),
        toast_detector: env_u64("TOAST_DETECTOR_MS").map(Duration::from_millis).unwrap_or(dt.toast_detector),
    };

    let metrics_port = env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok());

    Ok(Settings {
        api: ApiSettings { base_url, api_key, request_timeout },
        paths,
        timing,
        metrics_port,
    })
}
