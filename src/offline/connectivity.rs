//! Connectivity monitoring.
//!
//! A [`ConnectivityProbe`] answers one question: is the dependency
//! reachable right now. [`ConnectivityMonitor`] polls the probe on an
//! interval, publishes the answer through a watch channel, and notifies
//! listeners on every change.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::events::EventListeners;

/// Observed connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The dependency answered the last probe.
    Online,
    /// The dependency failed the last probe.
    Offline,
    /// No probe has completed yet.
    #[default]
    Unknown,
}

impl ConnectionStatus {
    /// Status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reachability check for one dependency.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// True when the dependency is reachable.
    async fn is_online(&self) -> bool;
}

/// Probe that always reports online.
///
/// Useful when connectivity never actually drops and only the queueing
/// behavior of the offline layer is wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeOnline;

#[async_trait]
impl ConnectivityProbe for AssumeOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Probe whose answer is set externally. Primarily for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    online: Arc<AtomicBool>,
}

impl StaticProbe {
    /// Probe with the given initial answer.
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    /// Change the answer returned by subsequent probes.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Connectivity Monitor
// ============================================================================

/// Polls a probe and publishes status changes.
pub struct ConnectivityMonitor {
    probe: Arc<dyn ConnectivityProbe>,
    poll_interval: Duration,
    status_tx: watch::Sender<ConnectionStatus>,
    listeners: EventListeners,
    shutdown: CancellationToken,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    /// Monitor polling the probe at the given interval. Status starts
    /// [`ConnectionStatus::Unknown`] until [`start`](Self::start) or
    /// [`check_now`](Self::check_now) runs a probe.
    pub fn new(probe: Arc<dyn ConnectivityProbe>, poll_interval: Duration) -> Self {
        let (status_tx, _status_rx) = watch::channel(ConnectionStatus::Unknown);
        Self {
            probe,
            poll_interval,
            status_tx,
            listeners: EventListeners::default(),
            shutdown: CancellationToken::new(),
            poll_task: Mutex::new(None),
        }
    }

    /// Share a listener registry with this monitor.
    pub fn with_listeners(mut self, listeners: EventListeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Last published status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Start the background poll loop; the first probe runs immediately.
    /// Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.poll_task.lock();
        if guard.is_some() {
            return;
        }
        let monitor = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let poll_interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.check_now().await;
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        });
        *guard = Some(handle);
    }

    /// Probe immediately and publish the result.
    pub async fn check_now(&self) -> ConnectionStatus {
        let status = if self.probe.is_online().await {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        };
        trace!(status = %status, "Probe completed");
        self.publish(status).await;
        status
    }

    /// Stop the background poll loop. The last published status remains
    /// readable.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
    }

    async fn publish(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(previous = %previous, current = %status, "Connection status changed");
            self.listeners.status_change(previous, status).await;
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.status())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_now_publishes_status() {
        let probe = StaticProbe::new(true);
        let monitor = ConnectivityMonitor::new(Arc::new(probe.clone()), Duration::from_secs(60));
        assert_eq!(monitor.status(), ConnectionStatus::Unknown);

        assert_eq!(monitor.check_now().await, ConnectionStatus::Online);
        assert_eq!(monitor.status(), ConnectionStatus::Online);

        probe.set_online(false);
        assert_eq!(monitor.check_now().await, ConnectionStatus::Offline);
        assert_eq!(monitor.status(), ConnectionStatus::Offline);
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes() {
        let probe = StaticProbe::new(false);
        let monitor = ConnectivityMonitor::new(Arc::new(probe.clone()), Duration::from_secs(60));
        let mut rx = monitor.subscribe();

        monitor.check_now().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Offline);

        probe.set_online(true);
        monitor.check_now().await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_detects_flip() {
        let probe = StaticProbe::new(true);
        let monitor = Arc::new(ConnectivityMonitor::new(
            Arc::new(probe.clone()),
            Duration::from_secs(5),
        ));
        monitor.start();

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(monitor.status(), ConnectionStatus::Online);

        probe.set_online(false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(monitor.status(), ConnectionStatus::Offline);

        monitor.stop();
    }
}
