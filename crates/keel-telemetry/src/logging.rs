//! Structured logging for keel services.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and either
//! a JSON or a pretty formatting layer. Middlewares log through the `tracing`
//! macros using the names in [`fields`], so access logs, audit events and
//! panic reports share one vocabulary.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_telemetry::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::production())?;
//! tracing::info!(request_id = "abc", "request completed");
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Whether logging is enabled.
    pub enabled: bool,

    /// Filter directive (e.g. `info`, `keel=debug,hyper=warn`).
    pub level: String,

    /// Emit JSON instead of human-readable lines.
    pub json_format: bool,

    /// Include span open/close events.
    pub span_events: bool,

    /// Include file and line.
    pub file_line_info: bool,

    /// Include thread ids.
    pub thread_ids: bool,

    /// Include the event target.
    pub include_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: "info".to_string(),
            json_format: true,
            span_events: false,
            file_line_info: false,
            thread_ids: false,
            include_target: true,
        }
    }
}

impl LogConfig {
    /// Human-readable debug output.
    #[must_use]
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            span_events: true,
            file_line_info: true,
            ..Self::default()
        }
    }

    /// JSON output at info level.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }
}

/// Initializes the global subscriber.
///
/// # Errors
///
/// Returns `TelemetryError::LoggingInit` if the filter is invalid or a
/// global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let filter = create_env_filter(&config.level)?;

    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_span_events(span_events)
        .with_file(config.file_line_info)
        .with_line_number(config.file_line_info)
        .with_thread_ids(config.thread_ids)
        .with_target(config.include_target);

    let layer = if config.json_format {
        layer.json().with_filter(filter).boxed()
    } else {
        layer.pretty().with_filter(filter).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| TelemetryError::LoggingInit(e.to_string()))
}

/// Creates an env filter from a directive string.
pub fn create_env_filter(filter: &str) -> TelemetryResult<EnvFilter> {
    EnvFilter::try_new(filter)
        .map_err(|e| TelemetryError::LoggingInit(format!("invalid log level: {e}")))
}

/// Standard log field names.
pub mod fields {
    /// Request correlation id.
    pub const REQUEST_ID: &str = "request_id";

    /// Trace id.
    pub const TRACE_ID: &str = "trace_id";

    /// Span id.
    pub const SPAN_ID: &str = "span_id";

    /// HTTP method.
    pub const METHOD: &str = "method";

    /// Request path.
    pub const PATH: &str = "path";

    /// Peer address.
    pub const REMOTE_ADDR: &str = "remote_addr";

    /// Response status.
    pub const STATUS: &str = "status";

    /// Request latency in milliseconds.
    pub const LATENCY_MS: &str = "latency_ms";

    /// Error text.
    pub const ERROR: &str = "error";
}

/// Target for security audit events.
pub const AUDIT_TARGET: &str = "keel::audit";
