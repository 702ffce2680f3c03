//! Structured logging setup.
//!
//! Builds a `tracing-subscriber` registry with an [`EnvFilter`] and one fmt
//! layer. `RUST_LOG` overrides the configured level when set.

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::error::EngineError;

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured, for development.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Newline-delimited JSON for log aggregation.
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset (`"info"`,
    /// `"usb_cam_qa=debug"`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Log span open and close events.
    pub span_events: bool,
    /// Include the worker thread name.
    pub thread_names: bool,
    /// Colour output (pretty and compact only).
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Compact,
            span_events: false,
            thread_names: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Filter from `RUST_LOG`, falling back to the configured level.
    pub fn filter(&self) -> Result<EnvFilter, EngineError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => Ok(EnvFilter::try_new(&self.level)?),
        }
    }
}

/// Install the global subscriber.
///
/// Calling it again after a subscriber is installed is not an error, so
/// tests and embedding applications can call it freely.
pub fn init(config: &LoggingConfig) -> Result<(), EngineError> {
    if tracing_subscriber::registry()
        .with(layer(config)?)
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already installed");
    }
    Ok(())
}

/// Filtered fmt layer for `config`, not yet installed anywhere.
pub fn layer(config: &LoggingConfig) -> Result<Box<dyn Layer<Registry> + Send + Sync>, EngineError> {
    let filter = config.filter()?;
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    Ok(match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_thread_names(config.thread_names)
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_thread_names(config.thread_names)
            .with_ansi(config.ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_thread_names(config.thread_names)
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
    })
}
