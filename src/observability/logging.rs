//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber for the binaries
//! - Honor `RUST_LOG` first, then the configured level
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - Log level configurable via config and environment

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when neither `RUST_LOG` nor the config names one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Install the subscriber. A second call is a no-op.
pub fn init_logging(level: &str) {
    let fallback = if level.is_empty() { DEFAULT_LOG_LEVEL } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("polaris_client={},polaris_cli={}", fallback, fallback).into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
