//! Structured logging.
//!
//! # Responsibilities
//! - Install the process-wide `tracing` subscriber once
//! - Pick the compact or JSON formatter from `logging.format`
//! - Honour `RUST_LOG` ahead of `logging.level`

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },
}

/// Build the filter: `RUST_LOG` when set, the configured directive otherwise.
pub fn filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
            directive: config.level.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Install the global subscriber. Returns `Ok(false)` when one already exists.
pub fn init(config: &LoggingConfig) -> Result<bool, LoggingError> {
    let filter = filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().flatten_event(true))
            .try_init()
            .is_ok(),
        LogFormat::Compact => registry.with(fmt::layer().compact()).try_init().is_ok(),
    };

    if installed {
        tracing::debug!(level = %config.level, format = ?config.format, "Logging initialized");
    }
    Ok(installed)
}
