//! # Keel Checkpoint
//!
//! Per-session state persistence.
//!
//! A checkpoint is the latest snapshot of one conversation or workflow,
//! keyed by a thread id. Every store implements [`Checkpointer`]:
//!
//! - [`MemoryCheckpointer`] keeps snapshots and a bounded history in process.
//! - [`RedisCheckpointer`] stores JSON records with a TTL and serializes
//!   writes per thread with a `SET NX` lock.
//! - [`DistributedCheckpointer`] pairs a primary with an optional secondary,
//!   mirrors writes synchronously or through a bounded queue, and fails over
//!   when the primary stops answering health checks.
//!
//! ## Example
//!
//! ```
//! use keel_checkpoint::{Checkpointer, MemoryCheckpointer, State};
//!
//! # tokio_test::block_on(async {
//! let store = MemoryCheckpointer::new();
//! let mut state = State::new();
//! state.insert("step".into(), serde_json::json!(3));
//!
//! store.save("thread-1", &state).await?;
//! assert_eq!(store.load("thread-1").await?, state);
//! # Ok::<(), keel_checkpoint::CheckpointError>(())
//! # }).unwrap();
//! ```

#![doc(html_root_url = "https://docs.rs/keel-checkpoint/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod distributed;
mod error;
mod memory;
mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use self::distributed::{
    ActiveBackend, DistributedCheckpointer, DistributedConfig, DistributedStatus, ReplicationMode,
};
pub use self::error::{CheckpointError, CheckpointResult};
pub use self::memory::MemoryCheckpointer;
pub use self::redis::{RedisCheckpointer, RedisCheckpointerConfig};

/// Session state snapshot.
pub type State = serde_json::Map<String, serde_json::Value>;

/// Summary of one stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Store-specific identifier.
    pub id: String,
    /// Thread the checkpoint belongs to.
    pub thread_id: String,
    /// First save.
    pub created_at: DateTime<Utc>,
    /// Most recent save.
    pub updated_at: DateTime<Utc>,
    /// Free-form annotations.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Approximate size of the snapshot, see [`estimate_state_size`].
    pub size: u64,
}

/// A store of session snapshots keyed by thread id.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Stores `state` as the latest snapshot of `thread_id`.
    async fn save(&self, thread_id: &str, state: &State) -> CheckpointResult<()>;

    /// Returns the latest snapshot, or [`CheckpointError::NotFound`].
    async fn load(&self, thread_id: &str) -> CheckpointResult<State>;

    /// Describes every stored checkpoint.
    async fn list(&self) -> CheckpointResult<Vec<CheckpointInfo>>;

    /// Removes the checkpoint. Missing threads are not an error.
    async fn delete(&self, thread_id: &str) -> CheckpointResult<()>;

    /// Whether a checkpoint exists.
    async fn exists(&self, thread_id: &str) -> CheckpointResult<bool>;

    /// Checks that the backend is reachable.
    async fn ping(&self) -> CheckpointResult<()> {
        Ok(())
    }

    /// Releases background tasks and connections.
    async fn close(&self) -> CheckpointResult<()> {
        Ok(())
    }
}

/// Approximate snapshot size: key lengths plus the rendered length of each
/// value, with strings counted without quotes.
pub fn estimate_state_size(state: &State) -> u64 {
    state
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.len(),
                other => other.to_string().len(),
            };
            (key.len() + rendered) as u64
        })
        .sum()
}
