//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for log aggregation (default)
//! - `pretty` - Human-readable with colors and indentation
//! - `compact` - Colored single-line output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact - defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: overrides filtering entirely (env_logger syntax)
//!
//! ## Examples
//!
//! ```bash
//! # Production JSON logging
//! LOG_FORMAT=json LOG_LEVEL=INFO ./techtemp-server
//!
//! # Watching a sensor node at a terminal
//! LOG_FORMAT=compact LOG_LEVEL=DEBUG ./techtemp-sensor
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose chatter is capped at warn
const NOISY_CRATES: &[&str] = &["rumqttc", "hyper", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; anything unknown is JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a level name; anything unknown is INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Only a literal `true` (any case) enables span events
pub fn parse_spans(s: &str) -> bool {
    s.eq_ignore_ascii_case("true")
}

/// Filter for `level` with noisy dependencies capped at warn
pub fn build_filter(level: Level) -> EnvFilter {
    let mut directives = vec![level.to_string().to_lowercase()];
    directives.extend(NOISY_CRATES.iter().map(|name| format!("{name}=warn")));
    EnvFilter::try_new(directives.join(",")).unwrap_or_else(|_| EnvFilter::new(level.to_string()))
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration
///
/// A second call (as happens across tests) leaves the first subscriber in
/// place.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::try_new(rust_log).unwrap_or_else(|_| build_filter(level)),
        Err(_) => build_filter(level),
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events(include_spans)))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_default());
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_spans(&env::var("LOG_SPANS").unwrap_or_default());

    init_logging(level, format, include_spans);
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a liveness monitor span
#[macro_export]
macro_rules! monitor_span {
    ($($field:tt)*) => {
        tracing::info_span!("monitor_operation", $($field)*)
    };
}

pub use {monitor_span, mqtt_span};
