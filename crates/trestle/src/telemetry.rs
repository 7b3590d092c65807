//! Structured logging for the bridge.
//!
//! The bridge runs inside the proxy's process, so logs go to stdout as
//! structured JSON by default and the engine's operator controls the
//! level through `RUST_LOG`.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Output format for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON, one event per line.
    #[default]
    Json,
    /// Human-readable output for development.
    Pretty,
}

/// Initialize the logging subsystem.
///
/// `default_level` applies when `RUST_LOG` is unset. Calling this twice
/// returns an error rather than replacing the installed subscriber.
pub fn init_logging(format: LogFormat, default_level: &str) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter),
    }
}

fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

fn init_pretty_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        let first = init_logging(LogFormat::Pretty, "debug");
        assert!(first.is_ok());
        let second = init_logging(LogFormat::Json, "info");
        assert!(second.is_err());
    }
}
