//! Primary/secondary checkpoint store with replication and failover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CheckpointError, CheckpointResult};
use crate::{CheckpointInfo, Checkpointer, State};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// How writes reach the secondary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// The secondary must acknowledge before a write returns.
    Sync,
    /// Writes are queued and applied by background workers.
    #[default]
    Async,
}

/// Backend currently serving requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveBackend {
    /// The primary.
    Primary,
    /// The secondary, after a failover.
    Secondary,
}

/// Replication and failover parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Mirror writes to the secondary.
    pub enable_replication: bool,
    /// Mirroring mode.
    pub replication_mode: ReplicationMode,
    /// Period of the background health check.
    pub health_check_interval: Duration,
    /// Switch to the secondary when the primary keeps failing.
    pub enable_auto_failover: bool,
    /// Consecutive primary failures that trigger a failover.
    pub max_failover_attempts: u32,
    /// Minimum time on the secondary before switching back.
    pub failback_delay: Duration,
    /// Capacity of the async replication queue.
    pub queue_capacity: usize,
    /// Workers draining the async replication queue.
    pub replication_workers: usize,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enable_replication: true,
            replication_mode: ReplicationMode::Async,
            health_check_interval: Duration::from_secs(30),
            enable_auto_failover: true,
            max_failover_attempts: 3,
            failback_delay: Duration::from_secs(5 * 60),
            queue_capacity: 1000,
            replication_workers: 3,
        }
    }
}

impl DistributedConfig {
    fn validate(&self) -> CheckpointResult<()> {
        if self.health_check_interval.is_zero() {
            return Err(CheckpointError::Config("health check interval must be positive".into()));
        }
        if self.max_failover_attempts == 0 {
            return Err(CheckpointError::Config("max failover attempts must be at least 1".into()));
        }
        if self.replication_mode == ReplicationMode::Async
            && (self.queue_capacity == 0 || self.replication_workers == 0)
        {
            return Err(CheckpointError::Config(
                "async replication needs a queue capacity and at least one worker".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a [`DistributedCheckpointer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributedStatus {
    /// Backend serving requests.
    pub active_backend: ActiveBackend,
    /// Last primary health result.
    pub primary_healthy: bool,
    /// Last secondary health result.
    pub secondary_healthy: bool,
    /// Whether the secondary is active.
    pub failed_over: bool,
    /// Failovers since creation.
    pub failover_count: u64,
    /// Primary failures since its last success.
    pub consecutive_failures: u32,
    /// Mirroring mode.
    pub replication_mode: ReplicationMode,
    /// Whether writes are mirrored.
    pub enable_replication: bool,
    /// Tasks waiting in the async replication queue.
    pub queue_depth: usize,
    /// Milliseconds since the last failover, while failed over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since_failover_ms: Option<u64>,
}

enum Task {
    Save { thread_id: String, state: State },
    Delete { thread_id: String },
}

#[derive(Debug)]
struct Health {
    primary_healthy: bool,
    secondary_healthy: bool,
    failed_over: bool,
    failover_count: u64,
    consecutive_failures: u32,
    last_failover: Option<Instant>,
}

struct Shared {
    primary: Arc<dyn Checkpointer>,
    secondary: Option<Arc<dyn Checkpointer>>,
    config: DistributedConfig,
    health: RwLock<Health>,
}

impl Shared {
    fn active(&self) -> (Arc<dyn Checkpointer>, ActiveBackend) {
        match (&self.secondary, self.health.read().failed_over) {
            (Some(secondary), true) => (Arc::clone(secondary), ActiveBackend::Secondary),
            _ => (Arc::clone(&self.primary), ActiveBackend::Primary),
        }
    }

    fn record_primary_success(&self) {
        self.health.write().consecutive_failures = 0;
    }

    /// Counts a primary failure. Returns true when this caused a failover.
    fn record_primary_failure(&self) -> bool {
        let mut health = self.health.write();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let should_fail_over = self.config.enable_auto_failover
            && !health.failed_over
            && self.secondary.is_some()
            && health.secondary_healthy
            && health.consecutive_failures >= self.config.max_failover_attempts;
        if should_fail_over {
            health.failed_over = true;
            health.failover_count += 1;
            health.last_failover = Some(Instant::now());
            warn!(
                failures = health.consecutive_failures,
                failover_count = health.failover_count,
                "checkpoint primary unavailable, failing over to secondary"
            );
        }
        should_fail_over
    }

    fn try_failback(&self) {
        let mut health = self.health.write();
        let delay_elapsed = health
            .last_failover
            .map_or(true, |at| at.elapsed() >= self.config.failback_delay);
        if health.failed_over && health.primary_healthy && delay_elapsed {
            health.failed_over = false;
            info!(failover_count = health.failover_count, "checkpoint primary healthy again, failing back");
        }
    }

    async fn check_health(&self) {
        let primary_ok = ping(self.primary.as_ref()).await;
        let secondary_ok = match &self.secondary {
            Some(secondary) => ping(secondary.as_ref()).await,
            None => false,
        };
        {
            let mut health = self.health.write();
            health.primary_healthy = primary_ok;
            health.secondary_healthy = secondary_ok;
        }
        debug!(primary = primary_ok, secondary = secondary_ok, "checkpoint health check");

        if primary_ok {
            self.record_primary_success();
            self.try_failback();
        } else {
            self.record_primary_failure();
        }
    }
}

async fn ping(backend: &dyn Checkpointer) -> bool {
    matches!(tokio::time::timeout(PING_TIMEOUT, backend.ping()).await, Ok(Ok(())))
}

async fn health_loop(shared: Weak<Shared>, interval: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                shared.check_health().await;
            }
            _ = &mut stop => break,
        }
    }
}

async fn replication_worker(
    id: usize,
    secondary: Arc<dyn Checkpointer>,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
) {
    loop {
        let task = queue.lock().await.recv().await;
        let Some(task) = task else { break };
        let (op, thread_id, result) = match task {
            Task::Save { thread_id, state } => {
                let result = secondary.save(&thread_id, &state).await;
                ("save", thread_id, result)
            }
            Task::Delete { thread_id } => {
                let result = secondary.delete(&thread_id).await;
                ("delete", thread_id, result)
            }
        };
        if let Err(err) = result {
            warn!(worker = id, op, thread_id = %thread_id, error = %err, "checkpoint replication failed");
        }
    }
    debug!(worker = id, "checkpoint replication worker stopped");
}

/// Checkpoints on a primary backend, mirrored to an optional secondary.
///
/// Requests go to the active backend, which is the primary until it fails
/// `max_failover_attempts` times in a row (health checks and request
/// failures both count) while the secondary is healthy. Once the primary is
/// healthy again and `failback_delay` has passed, the next health check
/// switches back.
///
/// With async replication, mirrored writes go through a bounded queue; when
/// it is full the write is dropped from replication and a warning is logged.
pub struct DistributedCheckpointer {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    health_stop: Mutex<Option<oneshot::Sender<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DistributedCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCheckpointer")
            .field("config", &self.shared.config)
            .field("health", &*self.shared.health.read())
            .finish_non_exhaustive()
    }
}

impl DistributedCheckpointer {
    /// Starts the health checker and, for async replication, the workers.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        primary: Arc<dyn Checkpointer>,
        secondary: Option<Arc<dyn Checkpointer>>,
        config: DistributedConfig,
    ) -> CheckpointResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CheckpointError::Config("distributed checkpointer needs a tokio runtime".into()))?;

        let shared = Arc::new(Shared {
            primary,
            health: RwLock::new(Health {
                primary_healthy: true,
                secondary_healthy: secondary.is_some(),
                failed_over: false,
                failover_count: 0,
                consecutive_failures: 0,
                last_failover: None,
            }),
            secondary,
            config,
        });

        let mut queue = None;
        let mut workers = Vec::new();
        if let (true, ReplicationMode::Async, Some(secondary)) = (
            shared.config.enable_replication,
            shared.config.replication_mode,
            &shared.secondary,
        ) {
            let (tx, rx) = mpsc::channel(shared.config.queue_capacity);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for id in 0..shared.config.replication_workers {
                workers.push(runtime.spawn(replication_worker(
                    id,
                    Arc::clone(secondary),
                    Arc::clone(&rx),
                )));
            }
            queue = Some(tx);
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let health_task = runtime.spawn(health_loop(
            Arc::downgrade(&shared),
            shared.config.health_check_interval,
            stop_rx,
        ));

        Ok(Self {
            shared,
            queue: Mutex::new(queue),
            workers: Mutex::new(workers),
            health_stop: Mutex::new(Some(stop_tx)),
            health_task: Mutex::new(Some(health_task)),
            closed: AtomicBool::new(false),
        })
    }

    /// Runs one health check immediately.
    pub async fn check_health(&self) {
        self.shared.check_health().await;
    }

    /// Backend currently serving requests.
    pub fn active_backend(&self) -> ActiveBackend {
        self.shared.active().1
    }

    /// Current failover and replication state.
    pub fn status(&self) -> DistributedStatus {
        let health = self.shared.health.read();
        let queue_depth = self
            .queue
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity());
        let active_backend = if health.failed_over {
            ActiveBackend::Secondary
        } else {
            ActiveBackend::Primary
        };
        DistributedStatus {
            active_backend,
            primary_healthy: health.primary_healthy,
            secondary_healthy: health.secondary_healthy,
            failed_over: health.failed_over,
            failover_count: health.failover_count,
            consecutive_failures: health.consecutive_failures,
            replication_mode: self.shared.config.replication_mode,
            enable_replication: self.shared.config.enable_replication,
            queue_depth,
            since_failover_ms: health
                .last_failover
                .filter(|_| health.failed_over)
                .map(|at| u64::try_from(at.elapsed().as_millis()).unwrap_or(u64::MAX)),
        }
    }

    fn ensure_open(&self) -> CheckpointResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CheckpointError::Closed)
        } else {
            Ok(())
        }
    }

    fn replicating(&self, active: ActiveBackend) -> Option<&Arc<dyn Checkpointer>> {
        if !self.shared.config.enable_replication || active != ActiveBackend::Primary {
            return None;
        }
        self.shared.secondary.as_ref()
    }

    async fn replicate(&self, secondary: &Arc<dyn Checkpointer>, task: Task) -> CheckpointResult<()> {
        match self.shared.config.replication_mode {
            ReplicationMode::Sync => {
                let (thread_id, result) = match &task {
                    Task::Save { thread_id, state } => (thread_id, secondary.save(thread_id, state).await),
                    Task::Delete { thread_id } => (thread_id, secondary.delete(thread_id).await),
                };
                result.map_err(|err| CheckpointError::Replication {
                    thread_id: thread_id.clone(),
                    message: err.to_string(),
                })
            }
            ReplicationMode::Async => {
                self.enqueue(task);
                Ok(())
            }
        }
    }

    fn enqueue(&self, task: Task) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else { return };
        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                let (Task::Save { thread_id, .. } | Task::Delete { thread_id }) = &task;
                warn!(thread_id = %thread_id, "checkpoint replication queue full, dropping write");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("checkpoint replication queue closed");
            }
        }
    }

    /// Records a failed request on `active`. Returns the secondary when this
    /// failure caused a failover, so the caller can retry there.
    fn failed_over_to(&self, active: ActiveBackend) -> Option<Arc<dyn Checkpointer>> {
        if active == ActiveBackend::Primary && self.shared.record_primary_failure() {
            self.shared.secondary.clone()
        } else {
            None
        }
    }
}

#[async_trait]
impl Checkpointer for DistributedCheckpointer {
    async fn save(&self, thread_id: &str, state: &State) -> CheckpointResult<()> {
        self.ensure_open()?;
        let (backend, active) = self.shared.active();
        match backend.save(thread_id, state).await {
            Ok(()) => {
                if active == ActiveBackend::Primary {
                    self.shared.record_primary_success();
                }
            }
            Err(err) => {
                return match self.failed_over_to(active) {
                    Some(secondary) => secondary.save(thread_id, state).await,
                    None => Err(err),
                };
            }
        }
        if let Some(secondary) = self.replicating(active) {
            let task = Task::Save {
                thread_id: thread_id.to_string(),
                state: state.clone(),
            };
            self.replicate(secondary, task).await?;
        }
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> CheckpointResult<State> {
        self.ensure_open()?;
        let (backend, active) = self.shared.active();
        match backend.load(thread_id).await {
            Ok(state) => {
                if active == ActiveBackend::Primary {
                    self.shared.record_primary_success();
                }
                Ok(state)
            }
            Err(err) if err.is_not_found() => match self.replicating(active) {
                Some(secondary) => {
                    debug!(thread_id, "checkpoint missing on primary, reading secondary");
                    secondary.load(thread_id).await.map_err(|_| err)
                }
                None => Err(err),
            },
            Err(err) => match self.failed_over_to(active) {
                Some(secondary) => secondary.load(thread_id).await,
                None => Err(err),
            },
        }
    }

    async fn list(&self) -> CheckpointResult<Vec<CheckpointInfo>> {
        self.ensure_open()?;
        let (backend, active) = self.shared.active();
        match backend.list().await {
            Ok(infos) => Ok(infos),
            Err(err) => match self.failed_over_to(active) {
                Some(secondary) => secondary.list().await,
                None => Err(err),
            },
        }
    }

    async fn delete(&self, thread_id: &str) -> CheckpointResult<()> {
        self.ensure_open()?;
        let (backend, active) = self.shared.active();
        if let Err(err) = backend.delete(thread_id).await {
            return match self.failed_over_to(active) {
                Some(secondary) => secondary.delete(thread_id).await,
                None => Err(err),
            };
        }
        if let Some(secondary) = self.replicating(active) {
            let task = Task::Delete {
                thread_id: thread_id.to_string(),
            };
            self.replicate(secondary, task).await?;
        }
        Ok(())
    }

    async fn exists(&self, thread_id: &str) -> CheckpointResult<bool> {
        self.ensure_open()?;
        let (backend, active) = self.shared.active();
        match backend.exists(thread_id).await {
            Ok(found) => Ok(found),
            Err(err) => match self.failed_over_to(active) {
                Some(secondary) => secondary.exists(thread_id).await,
                None => Err(err),
            },
        }
    }

    async fn ping(&self) -> CheckpointResult<()> {
        self.ensure_open()?;
        self.shared.active().0.ping().await
    }

    async fn close(&self) -> CheckpointResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(stop) = self.health_stop.lock().take() {
            let _ = stop.send(());
        }
        let health_task = self.health_task.lock().take();
        if let Some(task) = health_task {
            let _ = task.await;
        }

        // Dropping the sender lets the workers drain the queue and exit.
        self.queue.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "checkpoint replication worker failed");
            }
        }

        self.shared.primary.close().await?;
        if let Some(secondary) = &self.shared.secondary {
            secondary.close().await?;
        }
        info!("distributed checkpointer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryCheckpointer;
    use serde_json::json;

    /// Memory store that can be switched off.
    #[derive(Default)]
    struct Flaky {
        inner: MemoryCheckpointer,
        down: AtomicBool,
    }

    impl Flaky {
        fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        fn check(&self) -> CheckpointResult<()> {
            if self.down.load(Ordering::SeqCst) {
                Err(CheckpointError::Backend("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Checkpointer for Flaky {
        async fn save(&self, thread_id: &str, state: &State) -> CheckpointResult<()> {
            self.check()?;
            self.inner.save(thread_id, state).await
        }
        async fn load(&self, thread_id: &str) -> CheckpointResult<State> {
            self.check()?;
            self.inner.load(thread_id).await
        }
        async fn list(&self) -> CheckpointResult<Vec<CheckpointInfo>> {
            self.check()?;
            self.inner.list().await
        }
        async fn delete(&self, thread_id: &str) -> CheckpointResult<()> {
            self.check()?;
            self.inner.delete(thread_id).await
        }
        async fn exists(&self, thread_id: &str) -> CheckpointResult<bool> {
            self.check()?;
            self.inner.exists(thread_id).await
        }
        async fn ping(&self) -> CheckpointResult<()> {
            self.check()
        }
    }

    fn state(step: i64) -> State {
        let mut state = State::new();
        state.insert("step".into(), json!(step));
        state
    }

    fn config(mode: ReplicationMode) -> DistributedConfig {
        DistributedConfig {
            replication_mode: mode,
            health_check_interval: Duration::from_secs(3600),
            ..DistributedConfig::default()
        }
    }

    fn pair(config: DistributedConfig) -> (Arc<Flaky>, Arc<Flaky>, DistributedCheckpointer) {
        let primary = Arc::new(Flaky::default());
        let secondary = Arc::new(Flaky::default());
        let store = DistributedCheckpointer::new(
            primary.clone(),
            Some(secondary.clone() as Arc<dyn Checkpointer>),
            config,
        )
        .unwrap();
        (primary, secondary, store)
    }

    #[test]
    fn test_defaults() {
        let config = DistributedConfig::default();
        assert!(config.enable_replication);
        assert_eq!(config.replication_mode, ReplicationMode::Async);
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert!(config.enable_auto_failover);
        assert_eq!(config.max_failover_attempts, 3);
        assert_eq!(config.failback_delay, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, 1000);
        assert_eq!(config.replication_workers, 3);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let primary: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let err = DistributedCheckpointer::new(
            primary,
            None,
            DistributedConfig {
                queue_capacity: 0,
                ..DistributedConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Config(_)));
    }

    #[test]
    fn test_requires_runtime() {
        let primary: Arc<dyn Checkpointer> = Arc::new(MemoryCheckpointer::new());
        let err = DistributedCheckpointer::new(primary, None, DistributedConfig::default()).unwrap_err();
        assert!(err.to_string().contains("tokio runtime"));
    }

    #[tokio::test]
    async fn test_sync_replication_mirrors_writes() {
        let (primary, secondary, store) = pair(config(ReplicationMode::Sync));
        store.save("t1", &state(1)).await.unwrap();
        assert_eq!(primary.inner.load("t1").await.unwrap(), state(1));
        assert_eq!(secondary.inner.load("t1").await.unwrap(), state(1));

        store.delete("t1").await.unwrap();
        assert!(!secondary.inner.exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_replication_failure_is_reported() {
        let (primary, secondary, store) = pair(config(ReplicationMode::Sync));
        secondary.set_down(true);
        let err = store.save("t1", &state(1)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::Replication { .. }));
        assert!(primary.inner.exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_async_replication_drains_on_close() {
        let (_, secondary, store) = pair(config(ReplicationMode::Async));
        for step in 0..10 {
            store.save(&format!("t{step}"), &state(step)).await.unwrap();
        }
        store.close().await.unwrap();
        assert_eq!(secondary.inner.len(), 10);
    }

    #[tokio::test]
    async fn test_async_overflow_is_dropped() {
        let (primary, secondary, store) = pair(DistributedConfig {
            queue_capacity: 1,
            replication_workers: 1,
            ..config(ReplicationMode::Async)
        });
        // Workers cannot run between these saves on a single-threaded runtime.
        store.save("first", &state(1)).await.unwrap();
        store.save("second", &state(2)).await.unwrap();
        assert_eq!(store.status().queue_depth, 1);
        assert_eq!(primary.inner.len(), 2);

        store.close().await.unwrap();
        assert!(secondary.inner.exists("first").await.unwrap());
        assert!(!secondary.inner.exists("second").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_falls_back_to_secondary() {
        let (_, secondary, store) = pair(config(ReplicationMode::Sync));
        secondary.inner.save("only-there", &state(7)).await.unwrap();
        assert_eq!(store.load("only-there").await.unwrap(), state(7));
        assert!(store.load("nowhere").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failover_after_consecutive_health_failures() {
        let (primary, secondary, store) = pair(config(ReplicationMode::Sync));
        primary.set_down(true);

        store.check_health().await;
        store.check_health().await;
        assert_eq!(store.active_backend(), ActiveBackend::Primary);
        store.check_health().await;
        assert_eq!(store.active_backend(), ActiveBackend::Secondary);

        let status = store.status();
        assert!(status.failed_over);
        assert_eq!(status.failover_count, 1);
        assert!(!status.primary_healthy);
        assert!(status.secondary_healthy);
        assert!(status.since_failover_ms.is_some());

        store.save("t1", &state(1)).await.unwrap();
        assert!(secondary.inner.exists("t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_failover_to_unhealthy_secondary() {
        let (primary, secondary, store) = pair(config(ReplicationMode::Sync));
        primary.set_down(true);
        secondary.set_down(true);
        for _ in 0..5 {
            store.check_health().await;
        }
        assert_eq!(store.active_backend(), ActiveBackend::Primary);
        assert_eq!(store.status().failover_count, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let (primary, _, store) = pair(config(ReplicationMode::Sync));
        primary.set_down(true);
        store.check_health().await;
        store.check_health().await;
        primary.set_down(false);
        store.check_health().await;
        primary.set_down(true);
        store.check_health().await;
        store.check_health().await;
        assert_eq!(store.active_backend(), ActiveBackend::Primary);
        assert_eq!(store.status().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failback_waits_for_delay() {
        let (primary, _, store) = pair(DistributedConfig {
            failback_delay: Duration::from_secs(60),
            ..config(ReplicationMode::Sync)
        });
        primary.set_down(true);
        for _ in 0..3 {
            store.check_health().await;
        }
        assert_eq!(store.active_backend(), ActiveBackend::Secondary);

        primary.set_down(false);
        store.check_health().await;
        assert_eq!(store.active_backend(), ActiveBackend::Secondary);

        tokio::time::advance(Duration::from_secs(61)).await;
        store.check_health().await;
        assert_eq!(store.active_backend(), ActiveBackend::Primary);
        assert_eq!(store.status().failover_count, 1);
    }

    #[tokio::test]
    async fn test_request_failures_trigger_failover() {
        let (primary, secondary, store) = pair(DistributedConfig {
            max_failover_attempts: 1,
            ..config(ReplicationMode::Sync)
        });
        primary.set_down(true);
        store.save("t1", &state(1)).await.unwrap();
        assert_eq!(store.active_backend(), ActiveBackend::Secondary);
        assert_eq!(secondary.inner.load("t1").await.unwrap(), state(1));
    }

    #[tokio::test]
    async fn test_without_secondary_errors_surface() {
        let primary = Arc::new(Flaky::default());
        let store = DistributedCheckpointer::new(
            primary.clone(),
            None,
            DistributedConfig {
                max_failover_attempts: 1,
                ..config(ReplicationMode::Async)
            },
        )
        .unwrap();
        primary.set_down(true);
        assert!(matches!(
            store.save("t1", &state(1)).await.unwrap_err(),
            CheckpointError::Backend(_)
        ));
        assert_eq!(store.status().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_, _, store) = pair(config(ReplicationMode::Async));
        store.close().await.unwrap();
        store.close().await.unwrap();
        assert!(matches!(
            store.save("t1", &state(1)).await.unwrap_err(),
            CheckpointError::Closed
        ));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let status = DistributedStatus {
            active_backend: ActiveBackend::Secondary,
            primary_healthy: false,
            secondary_healthy: true,
            failed_over: true,
            failover_count: 1,
            consecutive_failures: 3,
            replication_mode: ReplicationMode::Async,
            enable_replication: true,
            queue_depth: 0,
            since_failover_ms: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["active_backend"], "secondary");
        assert_eq!(value["replication_mode"], "async");
    }
}
