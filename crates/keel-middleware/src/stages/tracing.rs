//! Server spans with W3C trace-context propagation.
//!
//! Continues the trace named by an inbound `traceparent`, or starts a new
//! one, and opens a server span named `METHOD route`. The trace and span ids
//! are echoed in `X-Trace-ID` and `X-Span-ID`, and the span context is stored
//! in the request context so handlers can create child spans.

use std::sync::Arc;

use keel_config::{MiddlewareName, TracingOptions};
use keel_core::{BoxFuture, Context, Handler, Middleware};
use keel_telemetry::tracing::{extract_context, span_ids};
use opentelemetry::global::BoxedTracer;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Response header carrying the trace id.
pub const TRACE_ID_HEADER: &str = "X-Trace-ID";
/// Response header carrying the server span id.
pub const SPAN_ID_HEADER: &str = "X-Span-ID";

const REQUEST_BODY_ATTRIBUTE: &str = "http.request.body";
const RESPONSE_BODY_ATTRIBUTE: &str = "http.response.body";
const REQUEST_ID_ATTRIBUTE: &str = "http.request.id";

fn truncated(body: &[u8], max: usize) -> String {
    let end = body.len().min(max);
    String::from_utf8_lossy(&body[..end]).into_owned()
}

/// Opens one server span per request.
pub struct TracingStage<T = BoxedTracer> {
    tracer: T,
    options: TracingOptions,
}

impl<T> std::fmt::Debug for TracingStage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracingStage")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T> TracingStage<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    /// Creates the stage around `tracer`.
    pub fn new(tracer: T, options: TracingOptions) -> Self {
        Self {
            tracer,
            options: options.complete(),
        }
    }
}

impl<T> Stage for TracingStage<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.options.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let parent = extract_context(ctx.headers());
            let route = ctx.route_pattern().to_string();

            let mut attributes = vec![
                KeyValue::new(attribute::HTTP_REQUEST_METHOD, ctx.method().to_string()),
                KeyValue::new(attribute::URL_PATH, ctx.path().to_string()),
                KeyValue::new(attribute::HTTP_ROUTE, route.clone()),
                KeyValue::new(attribute::CLIENT_ADDRESS, ctx.remote_addr().to_string()),
            ];
            if let Some(id) = ctx.request_id() {
                attributes.push(KeyValue::new(REQUEST_ID_ATTRIBUTE, id.to_string()));
            }
            if self.options.capture_request_body && !ctx.body().is_empty() {
                attributes.push(KeyValue::new(
                    REQUEST_BODY_ATTRIBUTE,
                    truncated(ctx.body(), self.options.max_body_size),
                ));
            }

            let span = self
                .tracer
                .span_builder(format!("{} {route}", ctx.method()))
                .with_kind(SpanKind::Server)
                .with_attributes(attributes)
                .start_with_context(&self.tracer, &parent);
            let cx = parent.with_span(span);

            if let Some((trace_id, span_id)) = span_ids(&cx) {
                ctx.set_header(TRACE_ID_HEADER, &trace_id);
                ctx.set_header(SPAN_ID_HEADER, &span_id);
            }

            next(ctx.clone().with_value(cx.clone())).await;

            let response = ctx.response();
            let status = response.status().as_u16();
            let span = cx.span();
            span.set_attribute(KeyValue::new(
                attribute::HTTP_RESPONSE_STATUS_CODE,
                i64::from(status),
            ));
            if self.options.capture_response_body {
                let body = response.body();
                if !body.is_empty() {
                    span.set_attribute(KeyValue::new(
                        RESPONSE_BODY_ATTRIBUTE,
                        truncated(&body, self.options.max_body_size),
                    ));
                }
            }
            if status >= 500 {
                span.set_status(Status::error(format!("HTTP {status}")));
            }
            span.end();
        })
    }
}

/// Builds [`TracingStage`] over the global tracer provider.
#[derive(Debug, Clone, Copy)]
pub struct TracingFactory;

impl MiddlewareFactory for TracingFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Tracing
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &TracingOptions = downcast(self.name(), config)?;
        let tracer = keel_telemetry::tracing::tracer("keel-middleware");
        Ok(TracingStage::new(tracer, options.clone()).into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{get, run};
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use keel_core::handler_fn;
    use keel_telemetry::tracing::build_provider;
    use keel_telemetry::TracingConfig;
    use opentelemetry::trace::TracerProvider as _;
    use parking_lot::Mutex;

    const TRACEPARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn stage(options: TracingOptions) -> Middleware {
        let provider = build_provider(&TracingConfig::default()).unwrap();
        TracingStage::new(provider.tracer("test"), options).into_middleware()
    }

    #[tokio::test]
    async fn test_continues_inbound_trace() {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let endpoint = handler_fn(move |ctx: Context| {
            let slot = Arc::clone(&slot);
            async move {
                let cx = ctx.value::<opentelemetry::Context>().cloned();
                *slot.lock() = cx.and_then(|cx| span_ids(&cx));
                ctx.string(StatusCode::OK, "ok");
            }
        });

        let request = Request::get("/orders")
            .header("traceparent", TRACEPARENT)
            .body(Bytes::new())
            .unwrap();
        let writer = run(stage(TracingOptions::default()), endpoint, request, "").await;

        let trace_id = writer.header("x-trace-id").unwrap();
        let span_id = writer.header("x-span-id").unwrap();
        assert_eq!(trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_ne!(span_id, "00f067aa0ba902b7");

        let (inner_trace, inner_span) = seen.lock().clone().unwrap();
        assert_eq!(inner_trace, trace_id.to_str().unwrap());
        assert_eq!(inner_span, span_id.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_starts_new_trace() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.string(StatusCode::INTERNAL_SERVER_ERROR, "fail");
        });
        let writer = run(stage(TracingOptions::default()), endpoint, get("/x"), "").await;
        let trace_id = writer.header("x-trace-id").unwrap();
        assert_eq!(trace_id.len(), 32);
        assert_eq!(writer.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_probe_paths_are_skipped() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.string(StatusCode::OK, "up");
        });
        let options = TracingOptions::default();
        let probe = options.skip.skip_paths[0].clone();
        let writer = run(stage(options), endpoint, get(&probe), "").await;
        assert!(writer.header("x-trace-id").is_none());
    }

    #[test]
    fn test_truncated_body() {
        assert_eq!(truncated(b"abcdef", 3), "abc");
        assert_eq!(truncated(b"ab", 10), "ab");
    }
}
