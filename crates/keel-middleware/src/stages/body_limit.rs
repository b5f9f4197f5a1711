//! Request body size cap.

use std::sync::Arc;

use http::header::CONTENT_LENGTH;
use keel_config::{BodyLimitOptions, MiddlewareName};
use keel_core::{BoxFuture, Context, Handler, KeelError, Middleware};
use tracing::debug;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Rejects requests whose body exceeds `max_size` with `413`.
///
/// The declared `Content-Length` is checked first so oversized uploads are
/// refused without looking at the body; the collected body length is
/// checked as well for chunked requests.
#[derive(Debug, Clone, Default)]
pub struct BodyLimitStage {
    options: BodyLimitOptions,
}

impl BodyLimitStage {
    /// Creates the stage.
    pub fn new(options: BodyLimitOptions) -> Self {
        Self {
            options: options.complete(),
        }
    }

    fn declared_length(ctx: &Context) -> Option<u64> {
        ctx.header(CONTENT_LENGTH.as_str())
            .and_then(|v| v.trim().parse().ok())
    }
}

impl Stage for BodyLimitStage {
    fn name(&self) -> &'static str {
        "body_limit"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.options.skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let limit = self.options.max_size;
            let size = Self::declared_length(&ctx)
                .unwrap_or(0)
                .max(ctx.body().len() as u64);
            if size > limit {
                debug!(size, limit, path = %ctx.path(), "request body too large");
                ctx.error(&KeelError::PayloadTooLarge { limit });
                return;
            }
            next(ctx).await;
        })
    }
}

/// Builds [`BodyLimitStage`] from [`BodyLimitOptions`].
#[derive(Debug, Clone, Copy)]
pub struct BodyLimitFactory;

impl MiddlewareFactory for BodyLimitFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::BodyLimit
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &BodyLimitOptions = downcast(self.name(), config)?;
        Ok(BodyLimitStage::new(options.clone()).into_middleware())
    }
}
