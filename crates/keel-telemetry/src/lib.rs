//! # Keel Telemetry
//!
//! Observability for keel services:
//!
//! - **Logging**: `tracing-subscriber` with JSON or pretty output
//! - **Metrics**: Prometheus text format via the `metrics` crate
//! - **Tracing**: OpenTelemetry with W3C propagation and optional OTLP export
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::service("orders", env!("CARGO_PKG_VERSION"))
//!     .with_otlp("http://localhost:4317", 0.1);
//!
//! let _guard = init_telemetry(config)?;
//! ```

#![doc(html_root_url = "https://docs.rs/keel-telemetry/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod tracing;

pub use config::{TelemetryConfig, ENVIRONMENT_VAR};
pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig, AUDIT_TARGET};
pub use self::metrics::{init_metrics, status_class, InFlightGuard, MetricsCollector, MetricsConfig};
pub use self::tracing::{init_tracing, shutdown_tracing, TracingConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Flushes and shuts down the tracer provider on drop.
///
/// Keep it alive for the lifetime of the application.
pub struct TelemetryGuard {
    tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl TelemetryGuard {
    /// Creates a new telemetry guard.
    #[must_use]
    pub fn new(tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>) -> Self {
        Self { tracer_provider }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            for result in provider.force_flush() {
                if let Err(e) = result {
                    ::tracing::warn!(error = %e, "failed to flush tracer provider");
                }
            }
            if let Err(e) = provider.shutdown() {
                ::tracing::warn!(error = %e, "failed to shut down tracer provider");
            }
        }
    }
}

/// Initializes logging, then metrics, then tracing.
///
/// # Errors
///
/// Returns `TelemetryError` if any subsystem fails to initialize.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryResult<TelemetryGuard> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    let tracer_provider = init_tracing(&config.tracing)?;
    Ok(TelemetryGuard::new(tracer_provider))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_without_provider() {
        drop(TelemetryGuard::new(None));
    }

    #[test]
    fn test_guard_flushes_provider() {
        let provider = crate::tracing::build_provider(&TracingConfig::default()).unwrap();
        drop(TelemetryGuard::new(Some(provider)));
    }
}
