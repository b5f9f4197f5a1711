//! Cross-origin resource sharing.
//!
//! Allowed origins are echoed back with `Vary: Origin`; a wildcard without
//! credentials answers `*`. Preflight requests (`OPTIONS` with an `Origin`)
//! are answered here with `204` and never reach the handler. Requests from
//! origins that are not allowed pass through without CORS headers, leaving
//! the browser to block them.

use std::sync::Arc;

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ORIGIN,
    VARY,
};
use http::{HeaderValue, Method, StatusCode};
use keel_config::{CorsOptions, MiddlewareName, ReloadableMiddleware};
use keel_core::{BoxFuture, Context, FieldError, Handler, Middleware, Validate};
use parking_lot::RwLock;

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

/// Applies the CORS policy.
#[derive(Debug)]
pub struct CorsStage {
    options: Arc<RwLock<Arc<CorsOptions>>>,
}

fn check(options: &CorsOptions) -> Result<(), FactoryError> {
    let errors: Vec<FieldError> = options
        .validate()
        .into_iter()
        .map(|e| e.nested("cors"))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FactoryError::invalid("cors", errors))
    }
}

impl CorsStage {
    /// Validates `options` and creates the stage.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::Invalid`] when the policy is inconsistent, for
    /// example a wildcard origin combined with credentials.
    pub fn new(options: CorsOptions) -> Result<Self, FactoryError> {
        let options = options.complete();
        check(&options)?;
        Ok(Self {
            options: Arc::new(RwLock::new(Arc::new(options))),
        })
    }

    fn shared(&self) -> Arc<RwLock<Arc<CorsOptions>>> {
        Arc::clone(&self.options)
    }
}

impl Stage for CorsStage {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let options = self.options.read().clone();
            let Some(origin) = ctx.header(ORIGIN.as_str()).map(str::to_string) else {
                next(ctx).await;
                return;
            };
            if !options.allows_origin(&origin) {
                next(ctx).await;
                return;
            }

            let wildcard = options.allow_origins.iter().any(|o| o == "*");
            let allow_origin = if wildcard && !options.allow_credentials {
                "*"
            } else {
                origin.as_str()
            };
            ctx.set_header(ACCESS_CONTROL_ALLOW_ORIGIN.as_str(), allow_origin);
            ctx.response()
                .append_header(VARY, HeaderValue::from_static("Origin"));
            if options.allow_credentials {
                ctx.set_header(ACCESS_CONTROL_ALLOW_CREDENTIALS.as_str(), "true");
            }
            if !options.expose_headers.is_empty() {
                ctx.set_header(
                    ACCESS_CONTROL_EXPOSE_HEADERS.as_str(),
                    &options.expose_headers.join(", "),
                );
            }

            if ctx.method() == Method::OPTIONS {
                ctx.set_header(
                    ACCESS_CONTROL_ALLOW_METHODS.as_str(),
                    &options.allow_methods.join(", "),
                );
                ctx.set_header(
                    ACCESS_CONTROL_ALLOW_HEADERS.as_str(),
                    &options.allow_headers.join(", "),
                );
                if options.max_age > 0 {
                    ctx.set_header(ACCESS_CONTROL_MAX_AGE.as_str(), &options.max_age.to_string());
                }
                ctx.response()
                    .write(StatusCode::NO_CONTENT, None, bytes::Bytes::new());
                return;
            }

            next(ctx).await;
        })
    }
}

/// Builds [`CorsStage`] from [`CorsOptions`].
#[derive(Debug, Clone, Copy)]
pub struct CorsFactory;

impl MiddlewareFactory for CorsFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::Cors
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &CorsOptions = downcast(self.name(), config)?;
        Ok(CorsStage::new(options.clone())?.into_middleware())
    }

    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let options: &CorsOptions = downcast(self.name(), config)?;
        let stage = CorsStage::new(options.clone())?;
        let shared = stage.shared();
        live.on_cors_change(move |next| {
            let next = next.clone().complete();
            check(&next)?;
            *shared.write() = Arc::new(next);
            Ok(())
        });
        Ok(stage.into_middleware())
    }
}
