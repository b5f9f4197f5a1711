//! Redis checkpoint store.
//!
//! Layout under the configured prefix (default `agent:checkpoint:`):
//!
//! | Key                         | Value                                  |
//! |-----------------------------|----------------------------------------|
//! | `<prefix><thread_id>`       | JSON record, expires after `ttl`       |
//! | `<prefix>lock:<thread_id>`  | lock token, expires after `lock_expiry`|

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CheckpointError, CheckpointResult};
use crate::{estimate_state_size, CheckpointInfo, Checkpointer, State};

const SCAN_COUNT: usize = 100;
const PING_TIMEOUT: Duration = Duration::from_secs(5);

// Deletes the lock only if it still holds our token.
const RELEASE_LOCK: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Connection and locking parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCheckpointerConfig {
    /// Server URL.
    pub url: String,
    /// Key prefix.
    pub prefix: String,
    /// Record expiry; zero keeps records forever.
    pub ttl: Duration,
    /// Serialize writes per thread.
    pub enable_lock: bool,
    /// How long a writer waits for the lock.
    pub lock_timeout: Duration,
    /// Lock expiry, bounding how long a crashed writer blocks others.
    pub lock_expiry: Duration,
    /// Pause between lock attempts.
    pub lock_retry: Duration,
}

impl Default for RedisCheckpointerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            prefix: "agent:checkpoint:".to_string(),
            ttl: Duration::from_secs(24 * 60 * 60),
            enable_lock: true,
            lock_timeout: Duration::from_secs(5),
            lock_expiry: Duration::from_secs(10),
            lock_retry: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Record {
    state: State,
    thread_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    state_size: u64,
}

impl Record {
    /// Record replacing `previous`, keeping its creation time and metadata.
    fn next(previous: Option<Self>, thread_id: &str, state: &State, now: DateTime<Utc>) -> Self {
        let (created_at, metadata) = previous
            .map(|p| (p.created_at, p.metadata))
            .unwrap_or_else(|| (now, serde_json::Map::new()));
        Self {
            state: state.clone(),
            thread_id: thread_id.to_string(),
            created_at,
            updated_at: now,
            metadata,
            state_size: estimate_state_size(state),
        }
    }

    fn info(self, key: String) -> CheckpointInfo {
        CheckpointInfo {
            id: key,
            thread_id: self.thread_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            metadata: self.metadata,
            size: self.state_size,
        }
    }
}

/// Checkpoints stored as JSON strings in Redis.
#[derive(Clone)]
pub struct RedisCheckpointer {
    pool: Pool,
    config: RedisCheckpointerConfig,
}

impl std::fmt::Debug for RedisCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCheckpointer")
            .field("prefix", &self.config.prefix)
            .field("ttl", &self.config.ttl)
            .field("enable_lock", &self.config.enable_lock)
            .finish_non_exhaustive()
    }
}

impl RedisCheckpointer {
    /// Creates a store over an existing pool. `config.url` is ignored.
    pub fn new(pool: Pool, config: RedisCheckpointerConfig) -> Self {
        Self { pool, config }
    }

    /// Creates a store with a lazily connecting pool for `config.url`.
    pub fn from_config(config: RedisCheckpointerConfig) -> CheckpointResult<Self> {
        if config.prefix.is_empty() {
            return Err(CheckpointError::Config("key prefix must not be empty".into()));
        }
        let url = redis::parse_redis_url(&config.url)
            .ok_or_else(|| CheckpointError::Config(format!("invalid redis url {:?}", config.url)))?;
        let pool = Config::from_url(url.as_str())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CheckpointError::Config(e.to_string()))?;
        Ok(Self::new(pool, config))
    }

    /// Active configuration.
    pub fn config(&self) -> &RedisCheckpointerConfig {
        &self.config
    }

    fn data_key(&self, thread_id: &str) -> String {
        format!("{}{thread_id}", self.config.prefix)
    }

    fn lock_key(&self, thread_id: &str) -> String {
        format!("{}lock:{thread_id}", self.config.prefix)
    }

    fn is_lock_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.config.prefix)
            .is_some_and(|rest| rest.starts_with("lock:"))
    }

    async fn conn(&self) -> CheckpointResult<Connection> {
        Ok(self.pool.get().await?)
    }

    async fn read(&self, conn: &mut Connection, key: &str) -> CheckpointResult<Option<Record>> {
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(conn).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(CheckpointError::from))
            .transpose()
    }

    async fn acquire_lock(&self, conn: &mut Connection, thread_id: &str) -> CheckpointResult<String> {
        let key = self.lock_key(thread_id);
        let token = uuid::Uuid::now_v7().to_string();
        let expiry_ms = u64::try_from(self.config.lock_expiry.as_millis()).unwrap_or(u64::MAX).max(1);
        let deadline = tokio::time::Instant::now() + self.config.lock_timeout;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(expiry_ms)
                .query_async(conn)
                .await?;
            if acquired.is_some() {
                return Ok(token);
            }
            if tokio::time::Instant::now() + self.config.lock_retry > deadline {
                return Err(CheckpointError::LockTimeout {
                    thread_id: thread_id.to_string(),
                });
            }
            debug!(thread_id, "checkpoint lock busy, retrying");
            tokio::time::sleep(self.config.lock_retry).await;
        }
    }

    async fn release_lock(&self, conn: &mut Connection, thread_id: &str, token: &str) {
        let released: Result<i64, _> = redis::Script::new(RELEASE_LOCK)
            .key(self.lock_key(thread_id))
            .arg(token)
            .invoke_async(conn)
            .await;
        if let Err(err) = released {
            warn!(thread_id, error = %err, "failed to release checkpoint lock");
        }
    }

    /// Runs `op` while holding the thread's write lock, when locking is on.
    async fn locked<T, F, Fut>(&self, thread_id: &str, op: F) -> CheckpointResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = CheckpointResult<T>>,
    {
        if !self.config.enable_lock {
            return op(self.conn().await?).await;
        }
        let mut lock_conn = self.conn().await?;
        let token = self.acquire_lock(&mut lock_conn, thread_id).await?;
        let result = op(self.conn().await?).await;
        self.release_lock(&mut lock_conn, thread_id, &token).await;
        result
    }

    async fn scan_keys(&self) -> CheckpointResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", self.config.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch.into_iter().filter(|key| !self.is_lock_key(key)));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    /// Number of stored checkpoints.
    pub async fn size(&self) -> CheckpointResult<usize> {
        Ok(self.scan_keys().await?.len())
    }

    /// Deletes checkpoints not updated within `max_age` and returns how many.
    pub async fn cleanup_old(&self, max_age: Duration) -> CheckpointResult<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut conn = self.conn().await?;
        let mut removed = 0;
        for key in self.scan_keys().await? {
            let Some(record) = self.read(&mut conn, &key).await? else {
                continue;
            };
            if now.signed_duration_since(record.updated_at) > max_age {
                let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "expired checkpoints removed from redis");
        }
        Ok(removed)
    }
}

#[async_trait]
impl Checkpointer for RedisCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> CheckpointResult<()> {
        let key = self.data_key(thread_id);
        let ttl = self.config.ttl.as_secs();
        self.locked(thread_id, |mut conn| async move {
            let previous = self.read(&mut conn, &key).await?;
            let record = Record::next(previous, thread_id, state, Utc::now());
            let payload = serde_json::to_string(&record)?;
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(payload);
            if ttl > 0 {
                cmd.arg("EX").arg(ttl);
            }
            let _: () = cmd.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn load(&self, thread_id: &str) -> CheckpointResult<State> {
        let mut conn = self.conn().await?;
        self.read(&mut conn, &self.data_key(thread_id))
            .await?
            .map(|record| record.state)
            .ok_or_else(|| CheckpointError::not_found(thread_id))
    }

    async fn list(&self) -> CheckpointResult<Vec<CheckpointInfo>> {
        let mut conn = self.conn().await?;
        let mut infos = Vec::new();
        for key in self.scan_keys().await? {
            // Expired between SCAN and GET.
            if let Some(record) = self.read(&mut conn, &key).await? {
                infos.push(record.info(key));
            }
        }
        Ok(infos)
    }

    async fn delete(&self, thread_id: &str) -> CheckpointResult<()> {
        let key = self.data_key(thread_id);
        self.locked(thread_id, |mut conn| async move {
            let _: () = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn exists(&self, thread_id: &str) -> CheckpointResult<bool> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("EXISTS")
            .arg(self.data_key(thread_id))
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn ping(&self) -> CheckpointResult<()> {
        let probe = async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<(), CheckpointError>(())
        };
        tokio::time::timeout(PING_TIMEOUT, probe)
            .await
            .map_err(|_| CheckpointError::Timeout)?
    }

    async fn close(&self) -> CheckpointResult<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(prefix: &str) -> RedisCheckpointer {
        RedisCheckpointer::from_config(RedisCheckpointerConfig {
            prefix: prefix.to_string(),
            ..RedisCheckpointerConfig::default()
        })
        .unwrap()
    }

    fn state(step: i64) -> State {
        let mut state = State::new();
        state.insert("step".into(), json!(step));
        state
    }

    #[test]
    fn test_defaults() {
        let config = RedisCheckpointerConfig::default();
        assert_eq!(config.prefix, "agent:checkpoint:");
        assert_eq!(config.ttl, Duration::from_secs(86_400));
        assert!(config.enable_lock);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_expiry, Duration::from_secs(10));
        assert_eq!(config.lock_retry, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_key_layout() {
        let store = store("agent:checkpoint:");
        assert_eq!(store.data_key("t1"), "agent:checkpoint:t1");
        assert_eq!(store.lock_key("t1"), "agent:checkpoint:lock:t1");
        assert!(store.is_lock_key("agent:checkpoint:lock:t1"));
        assert!(!store.is_lock_key("agent:checkpoint:t1"));
        assert!(!store.is_lock_key("other:lock:t1"));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let err = RedisCheckpointer::from_config(RedisCheckpointerConfig {
            url: "not a url".into(),
            ..RedisCheckpointerConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));

        let err = RedisCheckpointer::from_config(RedisCheckpointerConfig {
            prefix: String::new(),
            ..RedisCheckpointerConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[test]
    fn test_record_preserves_created_at() {
        let first_at = Utc::now() - chrono::Duration::minutes(5);
        let mut first = Record::next(None, "t1", &state(1), first_at);
        first.metadata.insert("owner".into(), json!("ops"));
        assert_eq!(first.created_at, first_at);

        let now = Utc::now();
        let second = Record::next(Some(first), "t1", &state(2), now);
        assert_eq!(second.created_at, first_at);
        assert_eq!(second.updated_at, now);
        assert_eq!(second.metadata["owner"], "ops");
        assert_eq!(second.state_size, estimate_state_size(&state(2)));
    }

    #[test]
    fn test_record_json_shape() {
        let record = Record::next(None, "t1", &state(1), Utc::now());
        let value = serde_json::to_value(&record).unwrap();
        for field in ["state", "thread_id", "created_at", "updated_at", "metadata", "state_size"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        let info = record.info("agent:checkpoint:t1".into());
        assert_eq!(info.id, "agent:checkpoint:t1");
        assert_eq!(info.thread_id, "t1");
    }

    #[tokio::test]
    async fn test_ping_unreachable_fails() {
        let store = RedisCheckpointer::from_config(RedisCheckpointerConfig {
            url: "redis://127.0.0.1:1/".into(),
            ..RedisCheckpointerConfig::default()
        })
        .unwrap();
        assert!(store.ping().await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires REDIS_URL"]
    async fn test_round_trip_against_redis() {
        let Ok(url) = std::env::var("REDIS_URL") else { return };
        let store = RedisCheckpointer::from_config(RedisCheckpointerConfig {
            url,
            prefix: format!("keel-test:{}:", uuid::Uuid::now_v7()),
            ..RedisCheckpointerConfig::default()
        })
        .unwrap();

        store.ping().await.unwrap();
        store.save("t1", &state(1)).await.unwrap();
        store.save("t1", &state(2)).await.unwrap();
        assert_eq!(store.load("t1").await.unwrap(), state(2));
        assert!(store.exists("t1").await.unwrap());
        assert_eq!(store.size().await.unwrap(), 1);
        assert_eq!(store.list().await.unwrap()[0].thread_id, "t1");

        store.delete("t1").await.unwrap();
        assert!(store.load("t1").await.unwrap_err().is_not_found());
        store.close().await.unwrap();
    }
}
