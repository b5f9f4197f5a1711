//! OpenTelemetry distributed tracing.
//!
//! Sets up an SDK tracer provider with an optional OTLP exporter and the W3C
//! trace-context propagator, and adapts `http::HeaderMap` to the
//! propagation traits so middlewares can continue inbound traces.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_telemetry::tracing::{init_tracing, TracingConfig};
//!
//! let config = TracingConfig {
//!     otlp_endpoint: "http://localhost:4317".to_string(),
//!     ..TracingConfig::default()
//! };
//! let provider = init_tracing(&config)?;
//! ```

use crate::error::TelemetryError;
use crate::TelemetryResult;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether tracing is enabled.
    pub enabled: bool,

    /// OTLP gRPC endpoint. Empty keeps spans in-process without exporting.
    pub otlp_endpoint: String,

    /// Service name for spans.
    pub service_name: String,

    /// Service version.
    pub service_version: String,

    /// Deployment environment.
    pub environment: String,

    /// Sampling ratio (0.0 to 1.0).
    pub sample_ratio: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: String::new(),
            service_name: "keel".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
            sample_ratio: 1.0,
        }
    }
}

impl TracingConfig {
    /// Production preset exporting to a local collector at 10% sampling.
    #[must_use]
    pub fn production(service_name: &str, version: &str) -> Self {
        Self {
            enabled: true,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: service_name.to_string(),
            service_version: version.to_string(),
            environment: "production".to_string(),
            sample_ratio: 0.1,
        }
    }

    /// Sampler for the configured ratio.
    pub fn sampler(&self) -> Sampler {
        if self.sample_ratio >= 1.0 {
            Sampler::AlwaysOn
        } else if self.sample_ratio <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.sample_ratio)
        }
    }
}

/// Builds a provider for `config` without installing it globally.
///
/// # Errors
///
/// Returns `TelemetryError::TracingInit` if the OTLP exporter cannot be built.
pub fn build_provider(config: &TracingConfig) -> TelemetryResult<TracerProvider> {
    let resource = Resource::new([
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
            config.service_version.clone(),
        ),
        KeyValue::new("deployment.environment", config.environment.clone()),
    ]);

    let mut builder = TracerProvider::builder()
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource);

    if !config.otlp_endpoint.is_empty() {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()
            .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;
        builder = builder.with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio);
    }

    Ok(builder.build())
}

/// Installs the global tracer provider and the W3C propagator.
///
/// Returns the provider so the caller can flush it on shutdown.
///
/// # Errors
///
/// Returns `TelemetryError::TracingInit` if initialization fails.
pub fn init_tracing(config: &TracingConfig) -> TelemetryResult<Option<TracerProvider>> {
    if !config.enabled {
        return Ok(None);
    }
    if !(0.0..=1.0).contains(&config.sample_ratio) {
        return Err(TelemetryError::InvalidConfig(format!(
            "sample ratio must be within 0.0..=1.0, got {}",
            config.sample_ratio
        )));
    }

    let provider = build_provider(config)?;
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(Some(provider))
}

/// Shuts down the global tracer provider.
pub fn shutdown_tracing() {
    global::shutdown_tracer_provider();
}

/// Returns a tracer from the global provider.
#[must_use]
pub fn tracer(name: &'static str) -> global::BoxedTracer {
    global::tracer(name)
}

/// Extracts the remote trace context from inbound headers.
///
/// Uses the W3C propagator directly so extraction works whether or not a
/// global propagator was installed.
pub fn extract_context(headers: &http::HeaderMap) -> opentelemetry::Context {
    TraceContextPropagator::new().extract(&HeaderExtractor(headers))
}

/// Injects `context` into outbound headers as `traceparent`/`tracestate`.
pub fn inject_context(context: &opentelemetry::Context, headers: &mut http::HeaderMap) {
    TraceContextPropagator::new().inject_context(context, &mut HeaderInjector(headers));
}

/// Hex trace id and span id of the span active in `context`, if it is valid.
pub fn span_ids(context: &opentelemetry::Context) -> Option<(String, String)> {
    let span = context.span();
    let span_context = span.span_context();
    span_context.is_valid().then(|| {
        (
            span_context.trace_id().to_string(),
            span_context.span_id().to_string(),
        )
    })
}

/// `Extractor` over `http::HeaderMap`.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

/// `Injector` over `http::HeaderMap`.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let (Ok(name), Ok(val)) = (
            http::header::HeaderName::try_from(key),
            http::header::HeaderValue::try_from(&value),
        ) {
            self.0.insert(name, val);
        }
    }
}
