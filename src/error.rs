// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

/// Failure of a call against the trader API.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API Error: {status} - {body}")]
    Status { status: u16, body: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("Trading not active")]
    TradingInactive,
    #[error("operation cancelled")]
    Cancelled,
}

impl ApiError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ApiError::Status { status: 429, .. })
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Transport(_) => "transport",
            ApiError::Status { status: 429, .. } => "rate_limited",
            ApiError::Status { .. } => "status",
            ApiError::Decode(_) => "decode",
            ApiError::TradingInactive => "inactive",
            ApiError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Decode(e.to_string())
    }
}
