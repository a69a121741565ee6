// ===============================
// src/lib.rs
// ===============================
pub mod cache;
pub mod config;
pub mod detector;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod normalize;
pub mod scheduler;
pub mod tasks;
pub mod toast;
pub mod transport;

pub use engine::{SyncHandle, TraderSync};
pub use error::ApiError;
