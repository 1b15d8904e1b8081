//! Tracing subscriber setup.

use std::io;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LogConfig;
use crate::error::{Result, SyncError};

/// Build the filter: `RUST_LOG` when set, the configured directive otherwise.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| SyncError::Config(format!("invalid log filter {:?}: {}", config.filter, e))),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = env_filter(config)?;

    let fmt_layer = if config.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(io::stderr)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_writer(io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialized: {}", e)))?;

    tracing::debug!(json = config.json, "logging initialized");
    Ok(())
}
