//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur during telemetry setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize metrics.
    #[error("failed to initialize metrics: {0}")]
    MetricsInit(String),

    /// Failed to initialize tracing.
    #[error("failed to initialize tracing: {0}")]
    TracingInit(String),

    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Invalid configuration.
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TelemetryError::MetricsInit("bad buckets".to_string());
        assert_eq!(err.to_string(), "failed to initialize metrics: bad buckets");
    }
}
