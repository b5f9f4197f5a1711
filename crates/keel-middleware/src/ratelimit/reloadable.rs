//! Limiter that can be replaced while requests are in flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_config::{LimiterBackend, RateLimitOptions};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::{build_limiter, Limiter};
use crate::error::LimiterError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shape {
    limit: u64,
    window: Duration,
    backend: LimiterBackend,
    redis_url: String,
    key_prefix: String,
}

impl Shape {
    fn of(options: &RateLimitOptions) -> Self {
        Self {
            limit: options.limit,
            window: options.window.to_std(),
            backend: options.backend,
            redis_url: options.redis_url.clone(),
            key_prefix: options.key_prefix.clone(),
        }
    }
}

/// Delegates to a limiter that is swapped atomically on reload.
///
/// Requests already holding the old limiter finish against it; new requests
/// see the replacement.
pub struct ReloadableLimiter {
    active: RwLock<Arc<dyn Limiter>>,
    shape: Mutex<Option<Shape>>,
}

impl std::fmt::Debug for ReloadableLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let active = self.current();
        f.debug_struct("ReloadableLimiter")
            .field("limit", &active.limit())
            .field("window", &active.window())
            .finish()
    }
}

impl ReloadableLimiter {
    /// Wraps an existing limiter.
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self {
            active: RwLock::new(limiter),
            shape: Mutex::new(None),
        }
    }

    /// Builds the limiter described by `options`.
    pub fn from_options(options: &RateLimitOptions) -> Result<Self, LimiterError> {
        let limiter = build_limiter(options)?;
        Ok(Self {
            active: RwLock::new(limiter),
            shape: Mutex::new(Some(Shape::of(options))),
        })
    }

    /// The limiter serving new requests.
    pub fn current(&self) -> Arc<dyn Limiter> {
        self.active.read().clone()
    }

    /// Installs `limiter` and returns the previous one.
    pub fn swap(&self, limiter: Arc<dyn Limiter>) -> Arc<dyn Limiter> {
        *self.shape.lock() = None;
        std::mem::replace(&mut *self.active.write(), limiter)
    }

    /// Rebuilds the store when the admission parameters changed.
    ///
    /// Returns `true` when a new store was installed. Skip lists and proxy
    /// settings do not affect the store and never trigger a rebuild.
    pub fn rebuild(&self, options: &RateLimitOptions) -> Result<bool, LimiterError> {
        let next = Shape::of(options);
        let mut shape = self.shape.lock();
        if shape.as_ref() == Some(&next) {
            return Ok(false);
        }
        let limiter = build_limiter(options)?;
        *self.active.write() = limiter;
        info!(
            limit = next.limit,
            window_ms = next.window.as_millis() as u64,
            "rate limiter rebuilt"
        );
        *shape = Some(next);
        Ok(true)
    }
}

#[async_trait]
impl Limiter for ReloadableLimiter {
    async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        let limiter = self.current();
        limiter.allow(key).await
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let limiter = self.current();
        limiter.reset(key).await
    }

    fn limit(&self) -> u64 {
        self.active.read().limit()
    }

    fn window(&self) -> Duration {
        self.active.read().window()
    }

    fn snapshot(&self) -> Option<Arc<dyn Limiter>> {
        Some(self.current())
    }
}
