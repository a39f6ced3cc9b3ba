//! Event interface for observing resilience mechanisms.
//!
//! Listeners implement [`ResilienceEvents`] and override only the hooks they
//! care about; every method has a default no-op body. Dispatch runs each
//! listener inside its own task so a panicking listener is captured and
//! logged instead of unwinding into the emitter.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::circuit::{CircuitMetrics, CircuitState};
use crate::error::CallError;
use crate::offline::{ConnectionStatus, OfflineOperation, SyncReport};
use crate::retry::RetryStats;

// ============================================================================
// Listener Trait
// ============================================================================

/// Hooks invoked as the resilience mechanisms make observable decisions.
///
/// All methods default to no-ops; implement the ones you need.
#[async_trait]
pub trait ResilienceEvents: Send + Sync {
    /// A retry was scheduled: `attempt` is the upcoming attempt number,
    /// `error` the failure that triggered it.
    async fn on_retry_scheduled(&self, attempt: u32, delay: Duration, error: &CallError) {
        let _ = (attempt, delay, error);
    }

    /// A call succeeded (possibly after retries).
    async fn on_retry_success(&self, stats: &RetryStats) {
        let _ = stats;
    }

    /// A call ran out of retry budget.
    async fn on_retry_exhausted(&self, stats: &RetryStats, error: &CallError) {
        let _ = (stats, error);
    }

    /// A call was cancelled through its token.
    async fn on_retry_aborted(&self, stats: &RetryStats) {
        let _ = stats;
    }

    /// The circuit transitioned between states.
    async fn on_circuit_state_change(
        &self,
        from: CircuitState,
        to: CircuitState,
        metrics: &CircuitMetrics,
    ) {
        let _ = (from, to, metrics);
    }

    /// An operation was added to the offline queue.
    async fn on_operation_queued(&self, operation: &OfflineOperation) {
        let _ = operation;
    }

    /// An operation left the queue without being executed (eviction,
    /// expiry, or merge displacement).
    async fn on_operation_dequeued(&self, operation: &OfflineOperation) {
        let _ = operation;
    }

    /// A queued operation was replayed successfully and removed.
    async fn on_operation_synced(&self, operation: &OfflineOperation) {
        let _ = operation;
    }

    /// A queued operation failed to replay and was retained.
    async fn on_sync_failed(&self, operation: &OfflineOperation, error: &CallError) {
        let _ = (operation, error);
    }

    /// A sync pass started with this many pending operations.
    async fn on_sync_started(&self, pending: usize) {
        let _ = pending;
    }

    /// A sync pass finished.
    async fn on_sync_completed(&self, report: &SyncReport) {
        let _ = report;
    }

    /// Observed connectivity changed.
    async fn on_status_change(&self, previous: ConnectionStatus, current: ConnectionStatus) {
        let _ = (previous, current);
    }
}

/// Shared, reference-counted listener.
pub type SharedListener = Arc<dyn ResilienceEvents>;

/// Handle returned by [`EventListeners::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// Dispatcher
// ============================================================================

type BoxedEvent = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Registry of listeners shared by the mechanisms of one coordinator.
///
/// Cloning is cheap and shares the underlying registry.
#[derive(Clone, Default)]
pub struct EventListeners {
    inner: Arc<RwLock<Vec<(ListenerId, SharedListener)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventListeners {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning a handle for later removal.
    pub fn subscribe(&self, listener: SharedListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.write().push((id, listener));
        id
    }

    /// Remove a previously registered listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Remove every registered listener.
    pub fn clear(&self) {
        self.inner.write().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    fn snapshot(&self) -> Vec<SharedListener> {
        self.inner
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Run one event against every listener, each in its own task.
    ///
    /// A listener that panics surfaces as a `JoinError` here; it is logged
    /// and the remaining listeners still run.
    async fn dispatch<F>(&self, event: &'static str, make: F)
    where
        F: Fn(SharedListener) -> BoxedEvent,
    {
        for listener in self.snapshot() {
            if let Err(error) = tokio::spawn(make(listener)).await {
                warn!(event, error = %error, "Event listener failed");
            }
        }
    }

    pub(crate) async fn retry_scheduled(&self, attempt: u32, delay: Duration, error: &CallError) {
        if self.is_empty() {
            return;
        }
        let error = error.clone();
        self.dispatch("retry_scheduled", move |listener| {
            let error = error.clone();
            Box::pin(async move { listener.on_retry_scheduled(attempt, delay, &error).await })
        })
        .await;
    }

    pub(crate) async fn retry_success(&self, stats: &RetryStats) {
        if self.is_empty() {
            return;
        }
        let stats = stats.clone();
        self.dispatch("retry_success", move |listener| {
            let stats = stats.clone();
            Box::pin(async move { listener.on_retry_success(&stats).await })
        })
        .await;
    }

    pub(crate) async fn retry_exhausted(&self, stats: &RetryStats, error: &CallError) {
        if self.is_empty() {
            return;
        }
        let stats = stats.clone();
        let error = error.clone();
        self.dispatch("retry_exhausted", move |listener| {
            let stats = stats.clone();
            let error = error.clone();
            Box::pin(async move { listener.on_retry_exhausted(&stats, &error).await })
        })
        .await;
    }

    pub(crate) async fn retry_aborted(&self, stats: &RetryStats) {
        if self.is_empty() {
            return;
        }
        let stats = stats.clone();
        self.dispatch("retry_aborted", move |listener| {
            let stats = stats.clone();
            Box::pin(async move { listener.on_retry_aborted(&stats).await })
        })
        .await;
    }

    pub(crate) async fn circuit_state_change(
        &self,
        from: CircuitState,
        to: CircuitState,
        metrics: &CircuitMetrics,
    ) {
        if self.is_empty() {
            return;
        }
        let metrics = *metrics;
        self.dispatch("circuit_state_change", move |listener| {
            Box::pin(async move { listener.on_circuit_state_change(from, to, &metrics).await })
        })
        .await;
    }

    pub(crate) async fn operation_queued(&self, operation: &OfflineOperation) {
        if self.is_empty() {
            return;
        }
        let operation = operation.clone();
        self.dispatch("operation_queued", move |listener| {
            let operation = operation.clone();
            Box::pin(async move { listener.on_operation_queued(&operation).await })
        })
        .await;
    }

    pub(crate) async fn operation_dequeued(&self, operation: &OfflineOperation) {
        if self.is_empty() {
            return;
        }
        let operation = operation.clone();
        self.dispatch("operation_dequeued", move |listener| {
            let operation = operation.clone();
            Box::pin(async move { listener.on_operation_dequeued(&operation).await })
        })
        .await;
    }

    pub(crate) async fn operation_synced(&self, operation: &OfflineOperation) {
        if self.is_empty() {
            return;
        }
        let operation = operation.clone();
        self.dispatch("operation_synced", move |listener| {
            let operation = operation.clone();
            Box::pin(async move { listener.on_operation_synced(&operation).await })
        })
        .await;
    }

    pub(crate) async fn sync_failed(&self, operation: &OfflineOperation, error: &CallError) {
        if self.is_empty() {
            return;
        }
        let operation = operation.clone();
        let error = error.clone();
        self.dispatch("sync_failed", move |listener| {
            let operation = operation.clone();
            let error = error.clone();
            Box::pin(async move { listener.on_sync_failed(&operation, &error).await })
        })
        .await;
    }

    pub(crate) async fn sync_started(&self, pending: usize) {
        if self.is_empty() {
            return;
        }
        self.dispatch("sync_started", move |listener| {
            Box::pin(async move { listener.on_sync_started(pending).await })
        })
        .await;
    }

    pub(crate) async fn sync_completed(&self, report: &SyncReport) {
        if self.is_empty() {
            return;
        }
        let report = report.clone();
        self.dispatch("sync_completed", move |listener| {
            let report = report.clone();
            Box::pin(async move { listener.on_sync_completed(&report).await })
        })
        .await;
    }

    pub(crate) async fn status_change(
        &self,
        previous: ConnectionStatus,
        current: ConnectionStatus,
    ) {
        if self.is_empty() {
            return;
        }
        self.dispatch("status_change", move |listener| {
            Box::pin(async move { listener.on_status_change(previous, current).await })
        })
        .await;
    }
}

impl fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListeners")
            .field("listeners", &self.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
