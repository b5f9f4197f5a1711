//! Per-request deadline.
//!
//! The rest of the chain runs in its own task so the stage can answer `504`
//! the moment the deadline passes. The handler is not aborted: it sees the
//! [`Deadline`] in its context and should stop on `ctx.done()`, and anything
//! it writes after the timeout response is discarded by the write-once
//! response writer. Panics in the handler task are caught here because they
//! cannot unwind into the recovery stage from another task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use keel_config::{MiddlewareName, ReloadableMiddleware, TimeoutOptions, DEFAULT_TIMEOUT};
use keel_core::{BoxFuture, Context, Deadline, Handler, KeelError, Middleware};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{error, warn};

use super::recovery::{install_panic_hook, panic_message, take_panic_stack};
use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Answers `504` when the handler misses its deadline.
#[derive(Debug, Clone, Default)]
pub struct TimeoutStage {
    options: Arc<RwLock<TimeoutOptions>>,
}

impl TimeoutStage {
    /// Creates the stage.
    pub fn new(options: TimeoutOptions) -> Self {
        install_panic_hook();
        Self {
            options: Arc::new(RwLock::new(options.complete())),
        }
    }

    /// Shared options, updated in place on reload.
    pub fn options(&self) -> Arc<RwLock<TimeoutOptions>> {
        Arc::clone(&self.options)
    }

    fn timeout_for(&self, path: &str) -> Option<Duration> {
        let options = self.options.read();
        if options.skip.should_skip(path) {
            return None;
        }
        let timeout = if options.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            options.timeout
        };
        Some(timeout.to_std())
    }
}

impl Stage for TimeoutStage {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(timeout) = self.timeout_for(ctx.path()) else {
                next(ctx).await;
                return;
            };

            let deadline = Instant::now() + timeout;
            let child = ctx.clone().with_value(Deadline(deadline));
            let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

            tokio::spawn(async move {
                if let Err(payload) = AssertUnwindSafe(next(child.clone())).catch_unwind().await {
                    let message = panic_message(payload.as_ref());
                    let stack = take_panic_stack().unwrap_or_default();
                    error!(
                        panic_value = %message,
                        stack = %stack,
                        path = %child.path(),
                        method = %child.method(),
                        request_id = child.request_id().unwrap_or(""),
                        "panic recovered in timed handler"
                    );
                    child.error(&KeelError::Panic { message });
                }
                let _ = done_tx.try_send(());
            });

            tokio::select! {
                _ = done_rx.recv() => {}
                () = sleep_until(deadline) => {
                    warn!(
                        path = %ctx.path(),
                        method = %ctx.method(),
                        timeout_ms = timeout.as_millis() as u64,
                        "request timed out"
                    );
                    ctx.error(&KeelError::RequestTimeout {
                        timeout,
                        client_induced: false,
                    });
                }
            }
        })
    }
}

/// Builds [`TimeoutStage`] from [`TimeoutOptions`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutFactory;

impl MiddlewareFactory for TimeoutFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Timeout
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &TimeoutOptions = downcast(self.name(), config)?;
        Ok(TimeoutStage::new(options.clone()).into_middleware())
    }

    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let options: &TimeoutOptions = downcast(self.name(), config)?;
        let stage = TimeoutStage::new(options.clone());
        let shared = stage.options();
        live.on_timeout_change(move |next| {
            *shared.write() = next.clone().complete();
            Ok(())
        });
        Ok(stage.into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::testing::{counting_endpoint, envelope, get, run};
    use http::StatusCode;
    use keel_config::{ConfigDuration, PathMatcher};
    use keel_core::handler_fn;

    fn stage(ms: i64) -> Middleware {
        TimeoutStage::new(TimeoutOptions {
            timeout: ConfigDuration::from_millis(ms),
            skip: PathMatcher::paths(["/stream"]),
        })
        .into_middleware()
    }

    fn sleeping(ms: u64) -> Handler {
        handler_fn(move |ctx: Context| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            ctx.string(StatusCode::OK, "slow");
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_gets_504() {
        let start = Instant::now();
        let writer = run(stage(50), sleeping(200), get("/slow"), "").await;

        assert_eq!(writer.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(envelope(&writer)["http_code"], 504);
        assert!(start.elapsed() < Duration::from_millis(200));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_handler_completes() {
        let (endpoint, _) = counting_endpoint();
        let writer = run(stage(50), endpoint, get("/fast"), "").await;
        assert_eq!(writer.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sees_deadline() {
        let endpoint = handler_fn(|ctx: Context| async move {
            ctx.done().await;
            ctx.string(StatusCode::OK, "cancelled");
        });
        let writer = run(stage(30), endpoint, get("/wait"), "").await;
        assert_eq!(writer.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_path_has_no_deadline() {
        let writer = run(stage(10), sleeping(100), get("/stream"), "").await;
        assert_eq!(writer.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_panic_in_handler_is_500() {
        let endpoint = handler_fn(|_ctx: Context| async move {
            panic!("timed boom");
        });
        let writer = run(stage(1_000), endpoint, get("/"), "").await;
        assert_eq!(writer.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_changes_timeout() {
        let live = ReloadableMiddleware::new(keel_config::Options::default());
        let middleware = TimeoutFactory
            .create_live(&TimeoutOptions::default(), &live)
            .unwrap();

        let mut next = live.get_options();
        next.timeout.timeout = ConfigDuration::from_millis(20);
        live.reload(next).unwrap();

        let writer = run(middleware, sleeping(100), get("/"), "").await;
        assert_eq!(writer.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
