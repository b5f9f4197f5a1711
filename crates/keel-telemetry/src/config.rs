//! Combined settings for [`init_telemetry`](crate::init_telemetry).

use crate::logging::LogConfig;
use crate::metrics::MetricsConfig;
use crate::tracing::TracingConfig;

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_VAR: &str = "APP_ENV";

/// Logging, metrics and tracing settings for one service.
///
/// The service identity is held once and copied into the tracing resource
/// by [`service`](Self::service), so the three subsystems never disagree.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `service.name` in spans.
    pub service_name: String,
    /// `service.version` in spans.
    pub service_version: String,
    /// `deployment.environment` in spans.
    pub environment: String,
    /// Prometheus collector.
    pub metrics: MetricsConfig,
    /// OpenTelemetry pipeline.
    pub tracing: TracingConfig,
    /// Log subscriber.
    pub logging: LogConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::service("keel", env!("CARGO_PKG_VERSION"))
    }
}

impl TelemetryConfig {
    /// Settings for `name` at `version`, in the environment named by
    /// `APP_ENV` (`development` when unset).
    ///
    /// Production and staging log JSON; anything else logs human-readable
    /// lines at debug level.
    pub fn service(name: &str, version: &str) -> Self {
        let environment = std::env::var(ENVIRONMENT_VAR)
            .map(|env| env.trim().to_ascii_lowercase())
            .ok()
            .filter(|env| !env.is_empty())
            .unwrap_or_else(|| "development".to_string());
        Self::in_environment(name, version, &environment)
    }

    /// Like [`service`](Self::service) with an explicit environment.
    pub fn in_environment(name: &str, version: &str, environment: &str) -> Self {
        let deployed = matches!(environment, "production" | "prod" | "staging");
        let logging = if deployed {
            LogConfig::default()
        } else {
            LogConfig::development()
        };
        Self {
            service_name: name.to_string(),
            service_version: version.to_string(),
            environment: environment.to_string(),
            metrics: MetricsConfig::default(),
            tracing: TracingConfig {
                service_name: name.to_string(),
                service_version: version.to_string(),
                environment: environment.to_string(),
                ..TracingConfig::default()
            },
            logging,
        }
    }

    /// Prefixes every metric with `namespace_subsystem_`.
    #[must_use]
    pub fn with_metrics_prefix(mut self, namespace: &str, subsystem: &str) -> Self {
        self.metrics.namespace = namespace.to_string();
        self.metrics.subsystem = subsystem.to_string();
        self
    }

    /// Exports spans to `endpoint`, sampling `ratio` of traces. An empty
    /// endpoint keeps spans in process.
    #[must_use]
    pub fn with_otlp(mut self, endpoint: &str, ratio: f64) -> Self {
        self.tracing.enabled = true;
        self.tracing.otlp_endpoint = endpoint.to_string();
        self.tracing.sample_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Turns the OpenTelemetry pipeline off.
    #[must_use]
    pub fn without_tracing(mut self) -> Self {
        self.tracing.enabled = false;
        self
    }

    /// Replaces the log filter directive.
    #[must_use]
    pub fn with_log_level(mut self, level: &str) -> Self {
        self.logging.level = level.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_copied_into_tracing() {
        let config = TelemetryConfig::in_environment("orders", "2.0.0", "production");
        assert_eq!(config.tracing.service_name, "orders");
        assert_eq!(config.tracing.service_version, "2.0.0");
        assert_eq!(config.tracing.environment, "production");
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_development_logs_plain() {
        let config = TelemetryConfig::in_environment("orders", "2.0.0", "development");
        assert!(!config.logging.json_format);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_metrics_prefix() {
        let config = TelemetryConfig::in_environment("orders", "1", "test")
            .with_metrics_prefix("orders", "api");
        assert_eq!(config.metrics.prefix(), "orders_api_");
    }

    #[test]
    fn test_otlp_ratio_clamped() {
        let config = TelemetryConfig::in_environment("orders", "1", "test")
            .without_tracing()
            .with_otlp("http://collector:4317", 3.0);
        assert!(config.tracing.enabled);
        assert_eq!(config.tracing.otlp_endpoint, "http://collector:4317");
        assert!((config.tracing.sample_ratio - 1.0).abs() < f64::EPSILON);
    }
}
