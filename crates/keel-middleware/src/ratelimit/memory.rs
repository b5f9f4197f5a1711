//! In-process sliding window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::Limiter;
use crate::error::LimiterError;

struct Window {
    requests: VecDeque<Instant>,
    last_check: Instant,
}

type Store = DashMap<String, Arc<Mutex<Window>>>;

/// Per-key sliding window held in memory.
///
/// Each key keeps the timestamps of its admitted requests. A sweeper task
/// runs once per window and drops keys idle for more than two windows.
pub struct MemoryLimiter {
    limit: u64,
    window: Duration,
    store: Arc<Store>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for MemoryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimiter")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("keys", &self.store.len())
            .finish()
    }
}

impl MemoryLimiter {
    /// Creates a limiter and starts its sweeper on the current runtime.
    ///
    /// Outside a tokio runtime, or with a zero window, no sweeper runs.
    pub fn new(limit: u64, window: Duration) -> Self {
        let store: Arc<Store> = Arc::new(DashMap::new());
        let (tx, rx) = oneshot::channel();

        let sweeping = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !window.is_zero() => {
                handle.spawn(sweep_loop(Arc::clone(&store), window, rx));
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("no tokio runtime; in-memory rate limiter runs without a sweeper");
                false
            }
        };

        Self {
            limit,
            window,
            store,
            stop: Mutex::new(sweeping.then_some(tx)),
        }
    }

    /// Stops the sweeper. Later calls do nothing.
    pub fn stop(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

impl Drop for MemoryLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl Limiter for MemoryLimiter {
    async fn allow(&self, key: &str) -> Result<bool, LimiterError> {
        let now = Instant::now();
        let entry = Arc::clone(
            self.store
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Window {
                        requests: VecDeque::new(),
                        last_check: now,
                    }))
                })
                .value(),
        );

        let mut window = entry.lock();
        window.last_check = now;
        if let Some(cutoff) = now.checked_sub(self.window) {
            while window.requests.front().is_some_and(|t| *t <= cutoff) {
                window.requests.pop_front();
            }
        }
        if window.requests.len() as u64 >= self.limit {
            return Ok(false);
        }
        window.requests.push_back(now);
        Ok(true)
    }

    async fn reset(&self, key: &str) -> Result<(), LimiterError> {
        self.store.remove(key);
        Ok(())
    }

    fn limit(&self) -> u64 {
        self.limit
    }

    fn window(&self) -> Duration {
        self.window
    }
}

async fn sweep_loop(store: Arc<Store>, window: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(window);
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&store, window),
            _ = &mut stop => break,
        }
    }
    debug!("rate limiter sweeper stopped");
}

fn sweep(store: &Store, window: Duration) {
    let Some(threshold) = Instant::now().checked_sub(window * 2) else {
        return;
    };
    let before = store.len();
    store.retain(|_, entry| entry.lock().last_check >= threshold);
    let removed = before.saturating_sub(store.len());
    if removed > 0 {
        debug!(removed, "expired rate limit keys swept");
    }
}
