//! Redis sorted-set sliding window shared across instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::debug;

use super::Limiter;
use crate::error::LimiterError;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "ratelimit:";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Sliding window stored as one sorted set per key, scored by timestamp.
///
/// One pipelined round trip per admission trims the set to the window,
/// counts it, adds the current request and refreshes the expiry. The count
/// is taken before the add, so concurrent callers may overshoot the limit
/// by the number of requests racing within one round trip.
#[derive(Clone)]
pub struct RedisLimiter {
    pool: Pool,
    limit: u64,
    window: Duration,
    prefix: String,
}

impl std::fmt::Debug for RedisLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisLimiter {
    /// Creates a limiter over an existing pool.
    pub fn new(pool: Pool, limit: u64, window: Duration) -> Self {
        Self {
            pool,
            limit,
            window,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    /// Creates a limiter with a lazily connecting pool for `url`.
    pub fn from_url(url: &str, limit: u64, window: Duration) -> Result<Self, LimiterError> {
        let client_url = redis::parse_redis_url(url)
            .ok_or_else(|| LimiterError::Config(format!("invalid redis url {url:?}")))?;
        let pool = Config::from_url(client_url.as_str())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        Ok(Self::new(pool, limit, window))
    }

    /// Replaces the key prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = if prefix.is_empty() {
            DEFAULT_PREFIX.to_string()
        } else {
            prefix.to_string()
        };
        self
    }

    /// Checks connectivity with `PING`.
    pub async fn ping(&self, timeout: Duration) -> Result<(), LimiterError> {
        let probe = async {
            let mut conn = self.pool.get().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), LimiterError>(())
        };
        tokio::time::timeout(timeout, probe)
            .await
            .map_err(|_| LimiterError::Timeout)?
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[async_trait]
impl Limiter for RedisLimiter {
    async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        let key = self.key(key);
        let now = now_nanos();
        let window = u64::try_from(self.window.as_nanos()).unwrap_or(u64::MAX);
        let expire_ms = u64::try_from(self.window.as_millis().saturating_mul(2)).unwrap_or(u64::MAX);
        let member = format!("{now}-{}", SEQUENCE.fetch_add(1, Ordering::Relaxed));

        let mut conn = self.pool.get().await?;
        let (count,): (u64,) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(now.saturating_sub(window))
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("ZADD")
            .arg(&key)
            .arg(now)
            .arg(&member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(expire_ms.max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;

        let allowed = count < self.limit;
        if !allowed {
            debug!(key = %key, count, limit = self.limit, "redis rate limit reached");
        }
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn window(&self) -> Duration {
        self.window
    }
}
