//! Prometheus scrape endpoint.

use http::StatusCode;
use keel_config::{MetricsOptions, MiddlewareName};
use keel_core::{handler_fn, Context, Router};
use keel_middleware::factory::downcast;
use keel_middleware::stages::metrics::collector_for;
use keel_middleware::{AnyConfig, FactoryError, RouteRegistrar};

/// Content type of the Prometheus text exposition format.
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Serves the collector the metrics middleware records into.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsRegistrar;

impl RouteRegistrar for MetricsRegistrar {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Metrics
    }

    fn register_routes(&self, router: &mut dyn Router, config: &dyn AnyConfig) -> Result<(), FactoryError> {
        let options: &MetricsOptions = downcast(self.name(), config)?;
        let options = options.clone().complete();
        let collector = collector_for(&options);
        router.get(
            &options.path,
            handler_fn(move |ctx: Context| {
                let text = collector.render();
                async move {
                    ctx.bytes(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, text.into());
                }
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::tests::fetch;
    use crate::HttpRouter;
    use std::time::Duration;

    #[tokio::test]
    async fn test_scrape_renders_shared_collector() {
        let options = MetricsOptions {
            namespace: "scrape".to_string(),
            subsystem: "test".to_string(),
            ..MetricsOptions::default()
        };
        collector_for(&options).record_request("GET", "/orders/{id}", 200, Duration::from_millis(3));

        let mut router = HttpRouter::new();
        MetricsRegistrar.register_routes(&mut router, &options).unwrap();
        let writer = fetch(&router, "/metrics").await;

        assert_eq!(writer.status(), StatusCode::OK);
        assert_eq!(writer.header("content-type").unwrap(), PROMETHEUS_CONTENT_TYPE);
        let body = String::from_utf8(writer.body().to_vec()).unwrap();
        assert!(body.contains("scrape_test_"));
        assert!(body.contains("/orders/{id}"));
    }
}
