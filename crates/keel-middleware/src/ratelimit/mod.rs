//! Sliding-window rate-limit stores.
//!
//! Every store implements [`Limiter`]. The rate-limit stage only knows the
//! trait, so the backend can be swapped at startup (memory or Redis) or at
//! runtime through [`ReloadableLimiter`].

mod memory;
mod redis;
mod reloadable;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_config::{LimiterBackend, RateLimitOptions};

use crate::error::LimiterError;

pub use self::memory::MemoryLimiter;
pub use self::redis::RedisLimiter;
pub use self::reloadable::ReloadableLimiter;

/// Admission control for a key.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Records a request for `key` and reports whether it is admitted.
    async fn allow(&self, key: &str) -> Result<bool, LimiterError>;

    /// Forgets the history of `key`.
    async fn reset(&self, key: &str) -> Result<(), LimiterError>;

    /// Requests admitted per window.
    fn limit(&self) -> u64;

    /// Window length.
    fn window(&self) -> Duration;

    /// The store currently deciding requests, for limiters that delegate.
    /// Callers pin one request to it so the verdict and the reported limit
    /// come from the same store.
    fn snapshot(&self) -> Option<Arc<dyn Limiter>> {
        None
    }
}

/// Builds the store selected by `options.backend`.
pub fn build_limiter(options: &RateLimitOptions) -> Result<Arc<dyn Limiter>, LimiterError> {
    let window = options.window.to_std();
    match options.backend {
        LimiterBackend::Memory => Ok(Arc::new(MemoryLimiter::new(options.limit, window))),
        LimiterBackend::Redis => Ok(Arc::new(
            RedisLimiter::from_url(&options.redis_url, options.limit, window)?
                .with_prefix(&options.key_prefix),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_config::ConfigDuration;

    #[tokio::test]
    async fn test_build_memory_limiter() {
        let options = RateLimitOptions {
            limit: 2,
            window: ConfigDuration::from_secs(5),
            ..RateLimitOptions::default()
        };
        let limiter = build_limiter(&options).unwrap();
        assert_eq!(limiter.limit(), 2);
        assert_eq!(limiter.window(), Duration::from_secs(5));
        assert!(limiter.allow("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_build_redis_limiter_is_lazy() {
        let options = RateLimitOptions {
            backend: LimiterBackend::Redis,
            redis_url: "redis://127.0.0.1:1/".to_string(),
            key_prefix: "rl:".to_string(),
            ..RateLimitOptions::default()
        };
        let limiter = build_limiter(&options).unwrap();
        assert_eq!(limiter.limit(), 100);
    }

    #[test]
    fn test_build_redis_limiter_rejects_bad_url() {
        let options = RateLimitOptions {
            backend: LimiterBackend::Redis,
            redis_url: "not a url".to_string(),
            ..RateLimitOptions::default()
        };
        assert!(matches!(
            build_limiter(&options),
            Err(LimiterError::Config(_))
        ));
    }
}
