//! Access logging.
//!
//! One event per finished request. Structured mode emits the fields
//! `method, path, remote_addr, latency_ms, request_id, status`; plain mode
//! formats the same data into a single line built in a pooled buffer.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use keel_config::{LoggerOptions, MiddlewareName, ReloadableMiddleware};
use keel_core::pool::Pool;
use keel_core::{BoxFuture, Context, Handler, Middleware};
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

const MAX_IDLE_LINES: usize = 128;

fn line_pool() -> &'static Pool<String> {
    static POOL: OnceLock<Pool<String>> = OnceLock::new();
    POOL.get_or_init(|| Pool::new(MAX_IDLE_LINES))
}

/// Logs every request after it completes.
#[derive(Debug, Clone, Default)]
pub struct LoggerStage {
    options: Arc<RwLock<LoggerOptions>>,
}

impl LoggerStage {
    /// Creates the stage.
    pub fn new(options: LoggerOptions) -> Self {
        Self {
            options: Arc::new(RwLock::new(options)),
        }
    }

    /// Shared options, updated in place on reload.
    pub fn options(&self) -> Arc<RwLock<LoggerOptions>> {
        Arc::clone(&self.options)
    }
}

impl Stage for LoggerStage {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let (skip, structured) = {
                let options = self.options.read();
                (
                    options.skip.should_skip(ctx.path()),
                    options.use_structured_logger,
                )
            };
            if skip {
                next(ctx).await;
                return;
            }

            let start = Instant::now();
            next(ctx.clone()).await;
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

            let response = ctx.response();
            let status = response.is_committed().then(|| response.status().as_u16());
            let request_id = ctx.request_id().unwrap_or_default();

            if structured {
                info!(
                    method = %ctx.method(),
                    path = %ctx.path(),
                    remote_addr = %ctx.remote_addr(),
                    latency_ms,
                    request_id,
                    status,
                    "request completed"
                );
            } else {
                let mut line = line_pool().acquire();
                let _ = write!(
                    line,
                    "{} {} {} {:.3}ms remote={}",
                    ctx.method(),
                    ctx.path(),
                    status.map_or_else(|| "-".to_string(), |s| s.to_string()),
                    latency_ms,
                    ctx.remote_addr(),
                );
                if !request_id.is_empty() {
                    let _ = write!(line, " request_id={request_id}");
                }
                info!("{}", line.as_str());
            }
        })
    }
}

/// Builds [`LoggerStage`] from [`LoggerOptions`].
#[derive(Debug, Clone, Copy)]
pub struct LoggerFactory;

impl MiddlewareFactory for LoggerFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Logger
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &LoggerOptions = downcast(self.name(), config)?;
        Ok(LoggerStage::new(options.clone()).into_middleware())
    }

    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let options: &LoggerOptions = downcast(self.name(), config)?;
        let stage = LoggerStage::new(options.clone());
        let shared = stage.options();
        live.on_logger_change(move |next| {
            *shared.write() = next.clone();
            Ok(())
        });
        Ok(stage.into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{counting_endpoint, get, run};
    use http::StatusCode;
    use keel_config::PathMatcher;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_passes_response_through() {
        let (endpoint, calls) = counting_endpoint();
        for structured in [true, false] {
            let stage = LoggerStage::new(LoggerOptions {
                use_structured_logger: structured,
                ..LoggerOptions::default()
            });
            let writer = run(stage.into_middleware(), endpoint.clone(), get("/x"), "10.0.0.1:5").await;
            assert_eq!(writer.status(), StatusCode::OK);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_skip_path_still_calls_next() {
        let (endpoint, calls) = counting_endpoint();
        let stage = LoggerStage::new(LoggerOptions {
            skip: PathMatcher::paths(["/health"]),
            ..LoggerOptions::default()
        });
        run(stage.into_middleware(), endpoint, get("/health"), "").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_plain_lines_return_to_pool() {
        let stage = LoggerStage::new(LoggerOptions {
            use_structured_logger: false,
            ..LoggerOptions::default()
        });
        let (endpoint, _) = counting_endpoint();
        run(stage.into_middleware(), endpoint, get("/pooled"), "").await;
        assert!(line_pool().idle() >= 1);
        assert!(line_pool().acquire().is_empty());
    }

    #[tokio::test]
    async fn test_reload_updates_skip_list() {
        let live = ReloadableMiddleware::new(keel_config::Options::default());
        let middleware = LoggerFactory
            .create_live(&LoggerOptions::default(), &live)
            .unwrap();

        let mut next = live.get_options();
        next.logger.skip = PathMatcher::paths(["/quiet"]);
        live.reload(next).unwrap();

        let (endpoint, calls) = counting_endpoint();
        run(middleware, endpoint, get("/quiet"), "").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
