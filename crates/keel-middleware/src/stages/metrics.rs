//! Prometheus request metrics.
//!
//! Counts requests and records latency by method, route template and status
//! class. Collectors are shared per metric prefix so the `/metrics` route
//! renders the same series this stage records.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use keel_config::{MetricsOptions, MiddlewareName, PathMatcher};
use keel_core::{BoxFuture, Context, Handler, MatchedPath, Middleware};
use keel_telemetry::{MetricsCollector, MetricsConfig};
use tokio::time::Instant;
use tracing::warn;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Path label for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "unmatched";

fn collectors() -> &'static DashMap<String, Arc<MetricsCollector>> {
    static COLLECTORS: OnceLock<DashMap<String, Arc<MetricsCollector>>> = OnceLock::new();
    COLLECTORS.get_or_init(DashMap::new)
}

/// Collector for the prefix configured in `options`.
///
/// The default prefix maps to [`MetricsCollector::global`].
pub fn collector_for(options: &MetricsOptions) -> Arc<MetricsCollector> {
    let prefix = options.prefix();
    let global = MetricsCollector::global();
    if prefix == MetricsConfig::default().prefix() {
        return global;
    }
    let entry = collectors().entry(prefix).or_insert_with(|| {
        let config = MetricsConfig {
            namespace: options.namespace.clone(),
            subsystem: options.subsystem.clone(),
            ..MetricsConfig::default()
        };
        match MetricsCollector::new(&config) {
            Ok(collector) => Arc::new(collector),
            Err(err) => {
                warn!(error = %err, "metrics collector init failed, using global collector");
                global
            }
        }
    });
    Arc::clone(entry.value())
}

/// Records request count, latency and in-flight requests.
#[derive(Debug, Clone)]
pub struct MetricsStage {
    collector: Arc<MetricsCollector>,
    skip: PathMatcher,
}

impl MetricsStage {
    /// Creates the stage recording into `collector`.
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self {
            collector,
            skip: PathMatcher::default(),
        }
    }

    /// Paths left out of the metrics.
    #[must_use]
    pub fn skip(mut self, skip: PathMatcher) -> Self {
        self.skip = skip;
        self
    }

    /// Collector the stage records into.
    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }
}

impl Stage for MetricsStage {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let start = Instant::now();
            {
                let _in_flight = self.collector.in_flight();
                next(ctx.clone()).await;
            }
            let route = ctx
                .value::<MatchedPath>()
                .map_or(UNMATCHED_ROUTE, |matched| matched.0.as_str());
            self.collector.record_request(
                ctx.method().as_str(),
                route,
                ctx.response().status().as_u16(),
                start.elapsed(),
            );
        })
    }
}

/// Builds [`MetricsStage`] from [`MetricsOptions`].
#[derive(Debug, Clone, Copy)]
pub struct MetricsFactory;

impl MiddlewareFactory for MetricsFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Metrics
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &MetricsOptions = downcast(self.name(), config)?;
        let options = options.clone().complete();
        let mut skip = options.skip.clone();
        skip.skip_paths.push(options.path.clone());
        Ok(MetricsStage::new(collector_for(&options))
            .skip(skip)
            .into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{counting_endpoint, get, run};

    fn isolated() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(&MetricsConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_records_route_template() {
        let collector = isolated();
        let stage = MetricsStage::new(Arc::clone(&collector));
        let middleware = stage.into_middleware();
        let (endpoint, _) = counting_endpoint();

        let handler = keel_core::chain(&[middleware], endpoint);
        let ctx = Context::from_request(get("/users/7"), "", false)
            .with_value(MatchedPath("/users/{id}".to_string()));
        handler(ctx).await;

        let text = collector.render();
        assert!(text.contains("keel_http_requests_total"));
        assert!(text.contains("path=\"/users/{id}\""));
        assert!(text.contains("status=\"2xx\""));
        assert!(!text.contains("/users/7"));
    }

    #[tokio::test]
    async fn test_unmatched_paths_share_one_series() {
        let collector = isolated();
        let middleware = MetricsStage::new(Arc::clone(&collector)).into_middleware();
        for i in 0..50 {
            let (endpoint, _) = counting_endpoint();
            run(middleware.clone(), endpoint, get(&format!("/scan/{i}")), "").await;
        }

        let text = collector.render();
        assert!(text.contains("path=\"unmatched\""), "{text}");
        assert!(!text.contains("/scan/"), "{text}");
        let series = text
            .lines()
            .filter(|line| line.starts_with("keel_http_requests_total{"))
            .count();
        assert_eq!(series, 1, "{text}");
    }

    #[tokio::test]
    async fn test_skip_paths_are_not_recorded() {
        let collector = isolated();
        let stage = MetricsStage::new(Arc::clone(&collector)).skip(PathMatcher::paths(["/metrics"]));
        let (endpoint, calls) = counting_endpoint();
        run(stage.into_middleware(), endpoint, get("/metrics"), "").await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!collector.render().contains("path=\"/metrics\""));
    }

    #[test]
    fn test_collector_shared_per_prefix() {
        let custom = MetricsOptions {
            namespace: "orders".to_string(),
            ..MetricsOptions::default()
        };
        assert!(Arc::ptr_eq(&collector_for(&custom), &collector_for(&custom)));
        assert!(Arc::ptr_eq(
            &collector_for(&MetricsOptions::default()),
            &MetricsCollector::global()
        ));
        assert!(!Arc::ptr_eq(&collector_for(&custom), &MetricsCollector::global()));
    }
}
