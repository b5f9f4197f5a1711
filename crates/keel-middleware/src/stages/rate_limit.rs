//! Per-client request admission.
//!
//! Every limited response carries `X-RateLimit-Limit`. A denied request gets
//! `Retry-After` (window length in seconds) and the `429` envelope. When the
//! store fails the request is admitted and the failure logged, so a Redis
//! outage degrades to no limiting instead of no service.
//!
//! The default key is the client IP. Forwarding headers are only honored
//! when `trust_proxy_headers` is set and the transport peer is one of the
//! trusted proxies.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use keel_config::{MiddlewareName, PathMatcher, RateLimitOptions, ReloadableMiddleware};
use keel_core::{BoxFuture, Context, Handler, KeelError, Middleware};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::FactoryError;
use crate::factory::{downcast, AnyConfig, MiddlewareFactory};
use crate::ratelimit::{Limiter, ReloadableLimiter};
use crate::stage::Stage;

/// Rate-limit response headers.
pub mod headers {
    /// Admissions per window.
    pub const LIMIT: &str = "X-RateLimit-Limit";
    /// Seconds until the client should retry.
    pub const RETRY_AFTER: &str = "Retry-After";
}

const FORWARDED_FOR: &str = "X-Forwarded-For";
const REAL_IP: &str = "X-Real-IP";

/// Derives the rate-limit key for a request.
pub type KeyFunc = Arc<dyn Fn(&Context) -> String + Send + Sync>;

/// Called with the context and key when a request is denied.
pub type LimitReachedCallback = Arc<dyn Fn(&Context, &str) + Send + Sync>;

/// Client address used as the default limiter key.
///
/// With `trust` set and the peer inside `trusted`, the first
/// `X-Forwarded-For` entry wins when it is a valid IP, then `X-Real-IP`.
/// Otherwise, and whenever those headers are unusable, the transport peer
/// IP is used. Falls back to the raw peer address when it does not parse.
pub fn client_ip(ctx: &Context, trust: bool, trusted: &[IpNetwork]) -> String {
    let peer = ctx.remote_ip();
    let peer_trusted = trust && peer.is_some_and(|ip| trusted.iter().any(|net| net.contains(ip)));

    if peer_trusted {
        let forwarded = ctx
            .header(FORWARDED_FOR)
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
        let real = ctx
            .header(REAL_IP)
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = real {
            return ip.to_string();
        }
    }

    peer.map_or_else(|| ctx.remote_addr().to_string(), |ip| ip.to_string())
}

#[derive(Debug, Clone)]
struct Settings {
    trust_proxy_headers: bool,
    trusted: Vec<IpNetwork>,
    skip: PathMatcher,
}

impl Settings {
    fn of(options: &RateLimitOptions) -> Self {
        Self {
            trust_proxy_headers: options.trust_proxy_headers,
            trusted: options.trusted_networks(),
            skip: options.skip.clone(),
        }
    }
}

/// Admits or rejects requests through a [`Limiter`].
pub struct RateLimitStage {
    settings: Arc<RwLock<Settings>>,
    limiter: Arc<dyn Limiter>,
    key_func: Option<KeyFunc>,
    on_limit_reached: Option<LimitReachedCallback>,
}

impl std::fmt::Debug for RateLimitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitStage")
            .field("settings", &*self.settings.read())
            .field("limit", &self.limiter.limit())
            .finish_non_exhaustive()
    }
}

impl RateLimitStage {
    /// Creates the stage with the proxy and skip settings of `options`.
    pub fn new(limiter: Arc<dyn Limiter>, options: &RateLimitOptions) -> Self {
        Self {
            settings: Arc::new(RwLock::new(Settings::of(options))),
            limiter,
            key_func: None,
            on_limit_reached: None,
        }
    }

    /// Replaces the client-IP key with a custom one.
    #[must_use]
    pub fn key_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context) -> String + Send + Sync + 'static,
    {
        self.key_func = Some(Arc::new(f));
        self
    }

    /// Sets the callback fired for each denied request.
    #[must_use]
    pub fn on_limit_reached<F>(mut self, f: F) -> Self
    where
        F: Fn(&Context, &str) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(f));
        self
    }

    fn key(&self, ctx: &Context) -> String {
        if let Some(key_func) = &self.key_func {
            return key_func(ctx);
        }
        let settings = self.settings.read();
        client_ip(ctx, settings.trust_proxy_headers, &settings.trusted)
    }
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn handle(self: Arc<Self>, ctx: Context, next: Handler) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.settings.read().skip.should_skip(ctx.path()) {
                next(ctx).await;
                return;
            }

            let key = self.key(&ctx);
            let limiter = self
                .limiter
                .snapshot()
                .unwrap_or_else(|| Arc::clone(&self.limiter));
            ctx.set_header(headers::LIMIT, &limiter.limit().to_string());

            match limiter.allow(&key).await {
                Ok(true) => next(ctx).await,
                Ok(false) => {
                    let retry_after = limiter.window().as_secs().max(1);
                    ctx.set_header(headers::RETRY_AFTER, &retry_after.to_string());
                    debug!(key = %key, path = %ctx.path(), "rate limit exceeded");
                    if let Some(callback) = &self.on_limit_reached {
                        callback(&ctx, &key);
                    }
                    ctx.error(&KeelError::RateLimitExceeded);
                }
                Err(err) => {
                    error!(error = %err, key = %key, "rate limiter failed, admitting request");
                    next(ctx).await;
                }
            }
        })
    }
}

/// Builds [`RateLimitStage`] over a [`ReloadableLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct RateLimitFactory;

impl RateLimitFactory {
    fn build(options: &RateLimitOptions) -> Result<(RateLimitStage, Arc<ReloadableLimiter>), FactoryError> {
        let limiter = ReloadableLimiter::from_options(options).map_err(|source| {
            FactoryError::Backend {
                name: MiddlewareName::RateLimit.as_str().to_string(),
                source,
            }
        })?;
        let limiter = Arc::new(limiter);
        let stage = RateLimitStage::new(Arc::clone(&limiter) as Arc<dyn Limiter>, options);
        Ok((stage, limiter))
    }
}

impl MiddlewareFactory for RateLimitFactory {
    fn name(&self) -> MiddlewareName {
        MiddlewareName::RateLimit
    }

    fn create(&self, config: &dyn AnyConfig) -> Result<Middleware, FactoryError> {
        let options: &RateLimitOptions = downcast(self.name(), config)?;
        let (stage, _) = Self::build(&options.clone().complete())?;
        Ok(stage.into_middleware())
    }

    fn create_live(
        &self,
        config: &dyn AnyConfig,
        live: &ReloadableMiddleware,
    ) -> Result<Middleware, FactoryError> {
        let options: &RateLimitOptions = downcast(self.name(), config)?;
        let (stage, limiter) = Self::build(&options.clone().complete())?;
        let settings = Arc::clone(&stage.settings);
        live.on_rate_limit_change(move |next| {
            if let Err(err) = limiter.rebuild(next) {
                warn!(error = %err, "rate limiter rebuild failed, keeping previous store");
                return Err(err.into());
            }
            *settings.write() = Settings::of(next);
            Ok(())
        });
        Ok(stage.into_middleware())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::MemoryLimiter;
    use crate::stages::testing::{counting_endpoint, envelope, get, run};
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use keel_config::ConfigDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx_with(remote: &str, headers: &[(&str, &str)]) -> Context {
        let mut builder = Request::get("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Context::from_request(builder.body(Bytes::new()).unwrap(), remote, false)
    }

    fn proxies() -> Vec<IpNetwork> {
        vec!["10.0.0.0/8".parse().unwrap()]
    }

    #[test]
    fn test_client_ip_trusted_proxy() {
        let ctx = ctx_with("10.0.0.1:1234", &[("X-Forwarded-For", "203.0.113.5, 10.0.0.1")]);
        assert_eq!(client_ip(&ctx, true, &proxies()), "203.0.113.5");
    }

    #[test]
    fn test_client_ip_untrusted_peer_ignores_headers() {
        let ctx = ctx_with("198.51.100.7:1234", &[("X-Forwarded-For", "203.0.113.5")]);
        assert_eq!(client_ip(&ctx, true, &proxies()), "198.51.100.7");
    }

    #[test]
    fn test_client_ip_trust_disabled() {
        let ctx = ctx_with("10.0.0.1:1234", &[("X-Forwarded-For", "203.0.113.5")]);
        assert_eq!(client_ip(&ctx, false, &proxies()), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_invalid_forwarded_falls_back() {
        let ctx = ctx_with(
            "10.0.0.1:1234",
            &[("X-Forwarded-For", "not-an-ip"), ("X-Real-IP", "203.0.113.9")],
        );
        assert_eq!(client_ip(&ctx, true, &proxies()), "203.0.113.9");

        let ctx = ctx_with("10.0.0.1:1234", &[("X-Forwarded-For", "garbage")]);
        assert_eq!(client_ip(&ctx, true, &proxies()), "10.0.0.1");
    }

    #[test]
    fn test_client_ip_unparsable_peer() {
        let ctx = ctx_with("pipe", &[]);
        assert_eq!(client_ip(&ctx, false, &[]), "pipe");
    }

    #[tokio::test(start_paused = true)]
    async fn test_denies_over_limit_with_headers() {
        let limiter = Arc::new(MemoryLimiter::new(2, Duration::from_secs(60)));
        let stage = RateLimitStage::new(limiter, &RateLimitOptions::default()).into_middleware();
        let (endpoint, calls) = counting_endpoint();

        for _ in 0..2 {
            let writer = run(stage.clone(), endpoint.clone(), get("/"), "192.0.2.1:1").await;
            assert_eq!(writer.status(), StatusCode::OK);
            assert_eq!(writer.header("x-ratelimit-limit").unwrap(), "2");
        }
        let writer = run(stage.clone(), endpoint.clone(), get("/"), "192.0.2.1:1").await;
        assert_eq!(writer.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(writer.header("retry-after").unwrap(), "60");
        assert_eq!(envelope(&writer)["http_code"], 429);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let other = run(stage, endpoint, get("/"), "192.0.2.2:1").await;
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_key_and_callback() {
        let denied = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&denied);
        let limiter = Arc::new(MemoryLimiter::new(1, Duration::from_secs(60)));
        let stage = RateLimitStage::new(limiter, &RateLimitOptions::default())
            .key_func(|_| "everyone".to_string())
            .on_limit_reached(move |_, key| {
                assert_eq!(key, "everyone");
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .into_middleware();
        let (endpoint, _) = counting_endpoint();

        run(stage.clone(), endpoint.clone(), get("/"), "192.0.2.1:1").await;
        let writer = run(stage, endpoint, get("/"), "192.0.2.99:1").await;
        assert_eq!(writer.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_paths_bypass_limiter() {
        let limiter = Arc::new(MemoryLimiter::new(0, Duration::from_secs(60)));
        let options = RateLimitOptions {
            skip: PathMatcher::paths(["/health"]),
            ..RateLimitOptions::default()
        };
        let stage = RateLimitStage::new(limiter, &options).into_middleware();
        let (endpoint, _) = counting_endpoint();
        let writer = run(stage, endpoint, get("/health"), "192.0.2.1:1").await;
        assert_eq!(writer.status(), StatusCode::OK);
        assert!(writer.header("x-ratelimit-limit").is_none());
    }

    /// Denies every request and installs `next` on the wrapping limiter
    /// while deciding.
    struct SwapWhileDeciding {
        wrapper: parking_lot::Mutex<Option<Arc<ReloadableLimiter>>>,
        next: Arc<dyn Limiter>,
    }

    #[async_trait::async_trait]
    impl Limiter for SwapWhileDeciding {
        async fn allow(&self, _key: &str) -> Result<bool, crate::LimiterError> {
            let wrapper = self.wrapper.lock().take();
            if let Some(wrapper) = wrapper {
                wrapper.swap(Arc::clone(&self.next));
            }
            Ok(false)
        }

        async fn reset(&self, _key: &str) -> Result<(), crate::LimiterError> {
            Ok(())
        }

        fn limit(&self) -> u64 {
            3
        }

        fn window(&self) -> Duration {
            Duration::from_secs(20)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_headers_describe_the_deciding_store() {
        let deciding = Arc::new(SwapWhileDeciding {
            wrapper: parking_lot::Mutex::new(None),
            next: Arc::new(MemoryLimiter::new(100, Duration::from_secs(90))),
        });
        let reloadable = Arc::new(ReloadableLimiter::new(Arc::clone(&deciding) as Arc<dyn Limiter>));
        *deciding.wrapper.lock() = Some(Arc::clone(&reloadable));

        let stage = RateLimitStage::new(reloadable.clone(), &RateLimitOptions::default()).into_middleware();
        let (endpoint, _) = counting_endpoint();
        let writer = run(stage, endpoint, get("/"), "192.0.2.1:1").await;

        assert_eq!(writer.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(writer.header("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(writer.header("retry-after").unwrap(), "20");
        assert_eq!(reloadable.limit(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_rebuilds_limiter() {
        let live = ReloadableMiddleware::new(keel_config::Options::default());
        let options = RateLimitOptions {
            limit: 1,
            window: ConfigDuration::from_secs(60),
            ..RateLimitOptions::default()
        };
        let middleware = RateLimitFactory.create_live(&options, &live).unwrap();
        let (endpoint, _) = counting_endpoint();

        run(middleware.clone(), endpoint.clone(), get("/"), "192.0.2.1:1").await;
        let denied = run(middleware.clone(), endpoint.clone(), get("/"), "192.0.2.1:1").await;
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

        let mut next = live.get_options();
        next.rate_limit.limit = 5;
        live.reload(next).unwrap();

        let writer = run(middleware, endpoint, get("/"), "192.0.2.1:1").await;
        assert_eq!(writer.status(), StatusCode::OK);
        assert_eq!(writer.header("x-ratelimit-limit").unwrap(), "5");
    }
}
