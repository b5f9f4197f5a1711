//! Graceful shutdown coordination.
//!
//! Both types are thin wrappers over a `tokio::sync::watch` channel:
//! [`ShutdownSignal`] publishes a latched flag and [`ConnectionTracker`]
//! publishes the number of open connections, so waiters never miss a
//! transition that happened before they subscribed.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// A latched, shareable shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    state: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Creates an untriggered signal.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Triggers shutdown. Later calls do nothing.
    pub fn trigger(&self) {
        self.state.send_if_modified(|triggered| !std::mem::replace(triggered, true));
    }

    /// True once [`trigger`](Self::trigger) was called.
    pub fn is_shutdown(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves when the signal triggers, immediately if it already has.
    pub fn triggered(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.subscribe();
        async move {
            // The sender lives in `self`; an error means every clone is gone.
            let _ = state.wait_for(|triggered| *triggered).await;
        }
    }

    /// A signal triggered by SIGTERM or SIGINT (Ctrl+C elsewhere).
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_os_signals() -> Self {
        let signal = Self::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            wait_for_os_signal().await;
            trigger.trigger();
        });
        signal
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
        (Err(err), _) | (_, Err(err)) => {
            error!(error = %err, "unix signal handlers unavailable; falling back to Ctrl+C");
            return wait_for_ctrl_c().await;
        }
    };
    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "stop requested");
}

#[cfg(not(unix))]
async fn wait_for_os_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Ctrl+C unavailable; only ServerHandle::shutdown stops the server");
        std::future::pending::<()>().await;
    }
    info!(signal = "ctrl-c", "stop requested");
}

/// Counts open connections.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    open: Arc<watch::Sender<usize>>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        let (open, _) = watch::channel(0);
        Self {
            open: Arc::new(open),
        }
    }
}

impl ConnectionTracker {
    /// Creates a tracker with no connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection; dropping the token releases it.
    pub fn acquire(&self) -> ConnectionToken {
        self.open.send_modify(|open| *open += 1);
        ConnectionToken {
            open: Arc::clone(&self.open),
        }
    }

    /// Live connection count.
    pub fn active_connections(&self) -> usize {
        *self.open.borrow()
    }

    /// Waits until every token has been dropped.
    pub async fn wait_idle(&self) {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open == 0).await;
    }
}

/// Held for the lifetime of one connection.
#[derive(Debug)]
pub struct ConnectionToken {
    open: Arc<watch::Sender<usize>>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        self.open.send_modify(|open| *open = open.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_latches_across_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutdown());
        signal.trigger();
        signal.trigger();
        assert!(clone.is_shutdown());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = tokio::spawn(signal.triggered());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_waiter_sees_earlier_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(10), signal.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_tracks_last_token() {
        let tracker = ConnectionTracker::new();
        let first = tracker.acquire();
        let second = tracker.acquire();
        assert_eq!(tracker.active_connections(), 2);

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        drop(first);
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        assert_eq!(tracker.active_connections(), 1);

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_without_connections() {
        tokio::time::timeout(Duration::from_millis(10), ConnectionTracker::new().wait_idle())
            .await
            .unwrap();
    }
}
