//! Prometheus request metrics.
//!
//! [`MetricsCollector`] owns its own Prometheus recorder instead of
//! installing one process-wide, so several collectors (one per test, or one
//! per chassis) never see each other's samples and [`reset`] can start a
//! collector from scratch.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `<prefix>requests_total` | Counter | `method`, `path`, `status` |
//! | `<prefix>request_duration_seconds` | Histogram | `method`, `path`, `status` |
//! | `<prefix>requests_in_flight` | Gauge | - |
//!
//! `path` is the route template (`/users/:id`), never the raw path, and
//! `status` is the class (`2xx`, `4xx`, ...), which keeps label cardinality
//! bounded.
//!
//! [`reset`]: MetricsCollector::reset

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Default latency buckets in seconds.
pub const DEFAULT_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL: OnceLock<Arc<MetricsCollector>> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric name namespace.
    pub namespace: String,

    /// Metric name subsystem.
    pub subsystem: String,

    /// Histogram buckets for request duration.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "keel".to_string(),
            subsystem: "http".to_string(),
            duration_buckets: DEFAULT_BUCKETS.to_vec(),
        }
    }
}

impl MetricsConfig {
    /// `namespace_subsystem_`, skipping empty parts.
    pub fn prefix(&self) -> String {
        let mut prefix = String::new();
        for part in [&self.namespace, &self.subsystem] {
            if !part.is_empty() {
                prefix.push_str(part);
                prefix.push('_');
            }
        }
        prefix
    }
}

struct Names {
    requests: String,
    duration: String,
    in_flight: String,
}

impl Names {
    fn new(prefix: &str) -> Self {
        Self {
            requests: format!("{prefix}requests_total"),
            duration: format!("{prefix}request_duration_seconds"),
            in_flight: format!("{prefix}requests_in_flight"),
        }
    }
}

struct Backend {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

/// Request counters and latency histograms rendered in Prometheus text format.
pub struct MetricsCollector {
    names: Names,
    buckets: Vec<f64>,
    backend: RwLock<Arc<Backend>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("requests", &self.names.requests)
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Creates a collector.
    ///
    /// # Errors
    ///
    /// Returns `TelemetryError::MetricsInit` if the buckets are rejected.
    pub fn new(config: &MetricsConfig) -> TelemetryResult<Self> {
        let names = Names::new(&config.prefix());
        let backend = build_backend(&config.duration_buckets, &names)?;
        Ok(Self {
            names,
            buckets: config.duration_buckets.clone(),
            backend: RwLock::new(Arc::new(backend)),
        })
    }

    /// Collector without latency buckets; histograms render as summaries.
    fn unbucketed(config: &MetricsConfig) -> Self {
        let names = Names::new(&config.prefix());
        let backend = plain_backend(&names);
        Self {
            names,
            buckets: Vec::new(),
            backend: RwLock::new(Arc::new(backend)),
        }
    }

    /// Process-wide collector with the default `keel_http_` prefix, or the
    /// one installed by [`init_metrics`].
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| {
            let config = MetricsConfig::default();
            Arc::new(Self::new(&config).unwrap_or_else(|_| Self::unbucketed(&config)))
        }))
    }

    /// Records one finished request.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        let backend = self.backend.read().clone();
        let labels = [
            ("method", method.to_string()),
            ("path", path.to_string()),
            ("status", status_class(status).to_string()),
        ];
        metrics::with_local_recorder(&backend.recorder, || {
            counter!(self.names.requests.clone(), &labels).increment(1);
            histogram!(self.names.duration.clone(), &labels).record(duration.as_secs_f64());
        });
    }

    /// Marks a request as started; the returned guard marks it finished.
    pub fn in_flight(&self) -> InFlightGuard<'_> {
        self.adjust_in_flight(1.0);
        InFlightGuard { collector: self }
    }

    fn adjust_in_flight(&self, delta: f64) {
        let backend = self.backend.read().clone();
        metrics::with_local_recorder(&backend.recorder, || {
            gauge!(self.names.in_flight.clone()).increment(delta);
        });
    }

    /// Renders every series in Prometheus text format.
    pub fn render(&self) -> String {
        self.backend.read().handle.render()
    }

    /// Drops every recorded sample.
    pub fn reset(&self) {
        let backend = build_backend(&self.buckets, &self.names)
            .unwrap_or_else(|_| plain_backend(&self.names));
        *self.backend.write() = Arc::new(backend);
    }
}

/// Decrements the in-flight gauge on drop, including during unwinding.
pub struct InFlightGuard<'a> {
    collector: &'a MetricsCollector,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.collector.adjust_in_flight(-1.0);
    }
}

fn build_backend(buckets: &[f64], names: &Names) -> TelemetryResult<Backend> {
    if buckets.is_empty() {
        return Ok(plain_backend(names));
    }
    let builder = PrometheusBuilder::new()
        .set_buckets(buckets)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    Ok(describe(builder.build_recorder(), names))
}

fn plain_backend(names: &Names) -> Backend {
    describe(PrometheusBuilder::new().build_recorder(), names)
}

fn describe(recorder: PrometheusRecorder, names: &Names) -> Backend {
    let handle = recorder.handle();
    metrics::with_local_recorder(&recorder, || {
        describe_counter!(names.requests.clone(), "Total number of HTTP requests");
        describe_histogram!(
            names.duration.clone(),
            metrics::Unit::Seconds,
            "HTTP request latency"
        );
        describe_gauge!(names.in_flight.clone(), "HTTP requests being served");
    });
    Backend { recorder, handle }
}

/// `200` becomes `2xx`.
pub fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}

/// Installs the process-wide collector.
///
/// The first call wins; later calls return the already installed collector.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<Arc<MetricsCollector>> {
    if let Some(existing) = GLOBAL.get() {
        return Ok(Arc::clone(existing));
    }
    let collector = Arc::new(MetricsCollector::new(config)?);
    Ok(Arc::clone(GLOBAL.get_or_init(|| collector)))
}
