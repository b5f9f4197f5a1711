//! In-process checkpoint store.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{CheckpointError, CheckpointResult};
use crate::{estimate_state_size, CheckpointInfo, Checkpointer, State};

/// Snapshots kept per thread besides the current one.
pub const DEFAULT_MAX_HISTORY: usize = 10;

struct Entry {
    state: State,
    info: CheckpointInfo,
    history: Vec<State>,
}

/// Checkpoints held in memory.
///
/// Each save pushes the previous snapshot onto a per-thread history, which
/// keeps at most `max_history` entries (oldest dropped first).
pub struct MemoryCheckpointer {
    entries: RwLock<HashMap<String, Entry>>,
    max_history: usize,
}

impl std::fmt::Debug for MemoryCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCheckpointer")
            .field("threads", &self.entries.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCheckpointer {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_MAX_HISTORY)
    }

    /// Creates an empty store keeping `max_history` previous snapshots.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_history,
        }
    }

    /// Number of stored threads.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Previous snapshots of `thread_id`, oldest first.
    pub fn history(&self, thread_id: &str) -> CheckpointResult<Vec<State>> {
        self.entries
            .read()
            .get(thread_id)
            .map(|entry| entry.history.clone())
            .ok_or_else(|| CheckpointError::not_found(thread_id))
    }

    /// Drops checkpoints not updated within `max_age` and returns how many.
    pub fn cleanup_old(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now.signed_duration_since(entry.info.updated_at) <= max_age);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "expired checkpoints removed");
        }
        removed
    }

    /// Runs [`cleanup_old`](Self::cleanup_old) every `interval` until the
    /// store is dropped or the returned task is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                store.cleanup_old(max_age);
            }
        })
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> CheckpointResult<()> {
        let now = Utc::now();
        let size = estimate_state_size(state);
        let mut entries = self.entries.write();
        match entries.get_mut(thread_id) {
            Some(entry) => {
                let previous = std::mem::replace(&mut entry.state, state.clone());
                if self.max_history > 0 {
                    if entry.history.len() >= self.max_history {
                        entry.history.remove(0);
                    }
                    entry.history.push(previous);
                }
                entry.info.updated_at = now;
                entry.info.size = size;
            }
            None => {
                let nanos = now.timestamp_nanos_opt().unwrap_or_default();
                entries.insert(
                    thread_id.to_string(),
                    Entry {
                        state: state.clone(),
                        info: CheckpointInfo {
                            id: format!("ckpt_{thread_id}_{nanos}"),
                            thread_id: thread_id.to_string(),
                            created_at: now,
                            updated_at: now,
                            metadata: serde_json::Map::new(),
                            size,
                        },
                        history: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> CheckpointResult<State> {
        self.entries
            .read()
            .get(thread_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| CheckpointError::not_found(thread_id))
    }

    async fn list(&self) -> CheckpointResult<Vec<CheckpointInfo>> {
        Ok(self.entries.read().values().map(|e| e.info.clone()).collect())
    }

    async fn delete(&self, thread_id: &str) -> CheckpointResult<()> {
        self.entries.write().remove(thread_id);
        Ok(())
    }

    async fn exists(&self, thread_id: &str) -> CheckpointResult<bool> {
        Ok(self.entries.read().contains_key(thread_id))
    }
}
