//! Security response headers.

use std::sync::Arc;

use keel_config::{MiddlewareName, SecurityHeadersOptions};
use keel_core::{BoxFuture, Context, Handler, Middleware};

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::stage::Stage;

const FORWARDED_PROTO: &str = "X-Forwarded-Proto";

/// Adds the configured security headers to every response.
///
/// Empty values are left out. `Strict-Transport-Security` is only sent over
/// TLS or behind a proxy reporting `X-Forwarded-Proto: https`.
#[derive(Debug, Clone)]
pub struct SecurityHeadersStage {
    fixed: Vec<(&'static str, String)>,
    hsts: Option<String>,
}

impl Default for SecurityHeadersStage {
    fn default() -> Self {
        Self::new(SecurityHeadersOptions::default())
    }
}

impl SecurityHeadersStage {
    /// Creates the stage.
    pub fn new(options: SecurityHeadersOptions) -> Self {
        let options = options.complete();
        let fixed = [
            ("X-Frame-Options", &options.x_frame_options),
            ("X-Content-Type-Options", &options.x_content_type_options),
            ("X-XSS-Protection", &options.x_xss_protection),
            ("Content-Security-Policy", &options.content_security_policy),
            ("Referrer-Policy", &options.referrer_policy),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| (name, value.clone()))
        .collect();
        Self {
            fixed,
            hsts: options.enable_hsts.then(|| options.hsts_value()),
        }
    }

    fn is_https(ctx: &Context) -> bool {
        ctx.is_tls()
            || ctx
                .header(FORWARDED_PROTO)
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    }
}

impl Stage for SecurityHeadersStage {
    fn name(&self) -> &'static str {
        "security_headers"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            for (name, value) in &self.fixed {
                ctx.set_header(name, value);
            }
            if let Some(hsts) = &self.hsts {
                if Self::is_https(&ctx) {
                    ctx.set_header("Strict-Transport-Security", hsts);
                }
            }
            next(ctx).await;
        })
    }
}

/// Builds [`SecurityHeadersStage`] from [`SecurityHeadersOptions`].
#[derive(Debug, Clone, Copy)]
pub struct SecurityHeadersFactory;

impl MiddlewareFactory for SecurityHeadersFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::SecurityHeaders
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &SecurityHeadersOptions = downcast(self.name(), config)?;
        Ok(SecurityHeadersStage::new(options.clone()).into_middleware())
    }
}
