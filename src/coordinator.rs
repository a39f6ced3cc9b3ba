//! Composition of retry, circuit breaking, and offline queueing.
//!
//! A [`ResilienceCoordinator`] wraps one dependency. Calls pass through the
//! circuit breaker first, then the retry executor, so the whole retry chain
//! records a single outcome on the circuit. When an offline queue is
//! configured, calls carrying a [`Deferrable`] are captured instead of
//! failing while the connection is down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::classify::ErrorCategory;
use crate::error::{CallError, ResilienceError};
use crate::events::{EventListeners, ListenerId, SharedListener};
use crate::offline::{
    ConnectionStatus, ConnectivityProbe, OfflineConfig, OfflineOperation, OfflineQueue,
    OfflineStore, SyncReport,
};
use crate::retry::{RetryExecutor, RetryPolicy};

// ============================================================================
// Call Options
// ============================================================================

/// Template for the queued form of a call, should it need deferring.
#[derive(Debug, Clone)]
pub struct Deferrable {
    /// Handler key for replay.
    pub op_type: String,
    /// Payload captured into the queue.
    pub payload: Value,
    /// Whether queued copies may merge with others of this type.
    pub mergeable: bool,
    /// Queue priority.
    pub priority: i32,
}

impl Deferrable {
    /// Deferrable of the given type with a payload.
    pub fn new(op_type: impl Into<String>, payload: Value) -> Self {
        Self {
            op_type: op_type.into(),
            payload,
            mergeable: false,
            priority: 0,
        }
    }

    /// Allow merging with queued operations of the same type.
    pub fn with_mergeable(mut self, mergeable: bool) -> Self {
        self.mergeable = mergeable;
        self
    }

    /// Set the queue priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn to_operation(&self) -> OfflineOperation {
        OfflineOperation::new(self.op_type.clone(), self.payload.clone())
            .with_mergeable(self.mergeable)
            .with_priority(self.priority)
    }
}

/// Per-call options for [`ResilienceCoordinator::execute`].
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// When set, the call is captured into the offline queue instead of
    /// failing while offline.
    pub deferrable: Option<Deferrable>,
}

impl ExecuteOptions {
    /// Options with no deferral.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the call deferrable.
    pub fn with_deferrable(mut self, deferrable: Deferrable) -> Self {
        self.deferrable = Some(deferrable);
        self
    }
}

/// How a coordinated call concluded.
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The call ran and produced a value.
    Completed(T),
    /// The call was captured into the offline queue.
    Queued {
        /// Id of the queued operation.
        id: Uuid,
    },
}

impl<T> CallOutcome<T> {
    /// True when the call was queued rather than run.
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued { .. })
    }

    /// The produced value, when the call ran.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Queued { .. } => None,
        }
    }

    /// The queued operation id, when the call was captured.
    pub fn queued_id(&self) -> Option<Uuid> {
        match self {
            Self::Completed(_) => None,
            Self::Queued { id } => Some(*id),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

/// Health of one mechanism inside a coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    /// Whether the mechanism considers itself healthy.
    pub healthy: bool,
    /// Human-readable condition.
    pub message: String,
    /// Mechanism-specific metrics.
    pub metrics: Value,
}

/// Health of a coordinator and its mechanisms.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Coordinator name.
    pub name: String,
    /// True when every mechanism is healthy.
    pub healthy: bool,
    /// Retry mechanism condition.
    pub retry: ComponentHealth,
    /// Circuit breaker condition.
    pub circuit: ComponentHealth,
    /// Offline queue condition, when configured.
    pub offline: Option<ComponentHealth>,
}

// ============================================================================
// Builder
// ============================================================================

/// Builds a [`ResilienceCoordinator`].
pub struct ResilienceCoordinatorBuilder {
    name: String,
    retry_policy: RetryPolicy,
    circuit_config: CircuitBreakerConfig,
    total_timeout: Option<Duration>,
    offline: Option<(
        OfflineConfig,
        Arc<dyn OfflineStore>,
        Arc<dyn ConnectivityProbe>,
    )>,
    listeners: Vec<SharedListener>,
}

impl ResilienceCoordinatorBuilder {
    /// Builder for a coordinator named after the dependency it wraps.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_policy: RetryPolicy::default(),
            circuit_config: CircuitBreakerConfig::default(),
            total_timeout: None,
            offline: None,
            listeners: Vec::new(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the circuit breaker configuration.
    pub fn with_circuit_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_config = config;
        self
    }

    /// Timeout for a whole coordinated call.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Enable offline queueing over the given store and probe.
    pub fn with_offline(
        mut self,
        config: OfflineConfig,
        store: Arc<dyn OfflineStore>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        self.offline = Some((config, store, probe));
        self
    }

    /// Subscribe a listener at build time.
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Build the coordinator, loading persisted offline state and starting
    /// background tasks.
    pub async fn build(self) -> Arc<ResilienceCoordinator> {
        let listeners = EventListeners::default();
        for listener in self.listeners {
            let _ = listeners.subscribe(listener);
        }

        let mut retry = RetryExecutor::new(self.retry_policy)
            .with_label(self.name.clone())
            .with_listeners(listeners.clone());
        if let Some(timeout) = self.total_timeout {
            retry = retry.with_total_timeout(timeout);
        }

        let circuit = CircuitBreaker::new(self.name.clone(), self.circuit_config)
            .with_listeners(listeners.clone());

        let offline = match self.offline {
            Some((config, store, probe)) => {
                let queue = OfflineQueue::with_listeners(config, store, probe, listeners.clone());
                queue.start().await;
                Some(queue)
            }
            None => None,
        };

        let coordinator = Arc::new(ResilienceCoordinator {
            name: self.name,
            retry,
            circuit,
            offline,
            listeners,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        });
        coordinator.spawn_online_watcher();
        info!(name = %coordinator.name, "Coordinator started");
        coordinator
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Retry, circuit breaking, and offline queueing behind one call surface.
#[derive(Debug)]
pub struct ResilienceCoordinator {
    name: String,
    retry: RetryExecutor,
    circuit: CircuitBreaker,
    offline: Option<Arc<OfflineQueue>>,
    listeners: EventListeners,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ResilienceCoordinator {
    /// Builder for a coordinator wrapping the named dependency.
    pub fn builder(name: impl Into<String>) -> ResilienceCoordinatorBuilder {
        ResilienceCoordinatorBuilder::new(name)
    }

    /// The wrapped dependency's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a call through the circuit breaker and retry executor.
    ///
    /// The circuit sees the whole retry chain as one call: rejection happens
    /// before the first attempt, and a single outcome is recorded when the
    /// chain concludes.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.circuit.execute(|| self.retry.execute(operation)).await
    }

    /// Like [`call`](Self::call), with offline capture.
    ///
    /// When the options carry a [`Deferrable`] and an offline queue is
    /// configured, the call is queued without running while the connection
    /// is known to be down, and a call that exhausts its retries on network
    /// errors is queued after a probe confirms the connection dropped.
    pub async fn execute<T, F, Fut>(
        &self,
        options: ExecuteOptions,
        operation: F,
    ) -> Result<CallOutcome<T>, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        if let (Some(queue), Some(deferrable)) = (&self.offline, &options.deferrable) {
            if queue.status() == ConnectionStatus::Offline {
                let id = queue.enqueue(deferrable.to_operation()).await;
                debug!(name = %self.name, id = %id, "Offline, operation deferred");
                return Ok(CallOutcome::Queued { id });
            }
        }

        match self.call(operation).await {
            Ok(value) => Ok(CallOutcome::Completed(value)),
            Err(error) => {
                if let (Some(queue), Some(deferrable)) = (&self.offline, &options.deferrable) {
                    if self.is_network_failure(&error)
                        && queue.check_now().await == ConnectionStatus::Offline
                    {
                        let id = queue.enqueue(deferrable.to_operation()).await;
                        info!(
                            name = %self.name,
                            id = %id,
                            "Call failed on a dropped connection, operation deferred"
                        );
                        return Ok(CallOutcome::Queued { id });
                    }
                }
                Err(error)
            }
        }
    }

    /// Probe connectivity now; [`ConnectionStatus::Unknown`] without an
    /// offline queue.
    pub async fn check_connectivity(&self) -> ConnectionStatus {
        match &self.offline {
            Some(queue) => queue.check_now().await,
            None => ConnectionStatus::Unknown,
        }
    }

    /// Replay queued operations now; empty report without an offline queue.
    pub async fn sync_offline(&self) -> SyncReport {
        match &self.offline {
            Some(queue) => queue.sync().await,
            None => SyncReport::default(),
        }
    }

    /// Return the circuit to closed and clear its window.
    pub async fn reset(&self) {
        self.circuit.reset().await;
    }

    /// Health of the coordinator and its mechanisms.
    pub fn health(&self) -> HealthReport {
        let policy = self.retry.policy();
        let retry = ComponentHealth {
            healthy: true,
            message: format!(
                "up to {} attempts, base delay {:?}, backoff x{}",
                policy.max_attempts, policy.base_delay, policy.backoff_factor
            ),
            metrics: serde_json::to_value(policy).unwrap_or(Value::Null),
        };

        let circuit_metrics = self.circuit.metrics();
        let circuit = ComponentHealth {
            healthy: circuit_metrics.state != CircuitState::Open,
            message: match circuit_metrics.state {
                CircuitState::Open => format!(
                    "circuit open, probe in {:?}",
                    circuit_metrics.time_until_probe.unwrap_or_default()
                ),
                CircuitState::HalfOpen => "circuit half-open, probing".to_string(),
                CircuitState::Closed => format!(
                    "circuit closed, {} of {} recent calls failed",
                    circuit_metrics.failures, circuit_metrics.total
                ),
            },
            metrics: serde_json::to_value(circuit_metrics).unwrap_or(Value::Null),
        };

        let offline = self.offline.as_ref().map(|queue| {
            let metrics = queue.metrics();
            ComponentHealth {
                healthy: metrics.status != ConnectionStatus::Offline
                    && metrics.pending < metrics.capacity,
                message: format!(
                    "{} pending of {} capacity, connection {}",
                    metrics.pending, metrics.capacity, metrics.status
                ),
                metrics: serde_json::to_value(&metrics).unwrap_or(Value::Null),
            }
        });

        let healthy = retry.healthy
            && circuit.healthy
            && offline.as_ref().map(|h| h.healthy).unwrap_or(true);
        HealthReport {
            name: self.name.clone(),
            healthy,
            retry,
            circuit,
            offline,
        }
    }

    /// Stop background tasks, persist offline state, and drop listeners.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        if let Some(queue) = &self.offline {
            queue.shutdown().await;
        }
        self.listeners.clear();
        info!(name = %self.name, "Coordinator shut down");
    }

    /// The circuit breaker.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// The retry executor.
    pub fn retry_executor(&self) -> &RetryExecutor {
        &self.retry
    }

    /// The offline queue, when configured.
    pub fn offline_queue(&self) -> Option<&Arc<OfflineQueue>> {
        self.offline.as_ref()
    }

    /// Subscribe a listener to this coordinator's events.
    pub fn subscribe(&self, listener: SharedListener) -> ListenerId {
        self.listeners.subscribe(listener)
    }

    /// Remove a previously subscribed listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    fn is_network_failure(&self, error: &ResilienceError) -> bool {
        error
            .call_error()
            .map(|call| self.retry.policy().classifier.classify(call) == ErrorCategory::Network)
            .unwrap_or(false)
    }

    fn spawn_online_watcher(self: &Arc<Self>) {
        let Some(queue) = &self.offline else { return };
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return;
        }
        let mut rx = queue.subscribe_status();
        // The monitor publishes every poll result, not only changes, so the
        // watcher has to detect the offline-to-online edge itself.
        let mut seen = *rx.borrow_and_update();
        let coordinator = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *rx.borrow_and_update();
                        let previous = seen;
                        seen = status;
                        let Some(coordinator) = coordinator.upgrade() else { break };
                        if previous == ConnectionStatus::Offline
                            && status == ConnectionStatus::Online
                            && coordinator.circuit.state() == CircuitState::Open
                        {
                            info!(
                                name = %coordinator.name,
                                "Connection restored, resetting circuit"
                            );
                            coordinator.circuit.reset().await;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        *guard = Some(handle);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Named coordinators for an application's dependencies.
#[derive(Debug, Default)]
pub struct CoordinatorRegistry {
    inner: RwLock<HashMap<String, Arc<ResilienceCoordinator>>>,
}

impl CoordinatorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a coordinator under its name, returning any replaced one.
    pub fn register(
        &self,
        coordinator: Arc<ResilienceCoordinator>,
    ) -> Option<Arc<ResilienceCoordinator>> {
        self.inner
            .write()
            .insert(coordinator.name().to_string(), coordinator)
    }

    /// Look up a coordinator by name.
    pub fn get(&self, name: &str) -> Option<Arc<ResilienceCoordinator>> {
        self.inner.read().get(name).cloned()
    }

    /// Remove a coordinator by name.
    pub fn remove(&self, name: &str) -> Option<Arc<ResilienceCoordinator>> {
        self.inner.write().remove(name)
    }

    /// Names of registered coordinators.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Number of registered coordinators.
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Health of every registered coordinator.
    pub fn health(&self) -> Vec<HealthReport> {
        self.inner.read().values().map(|c| c.health()).collect()
    }

    /// Shut down and drop every registered coordinator.
    pub async fn shutdown_all(&self) {
        let coordinators: Vec<Arc<ResilienceCoordinator>> = {
            let mut inner = self.inner.write();
            inner.drain().map(|(_, coordinator)| coordinator).collect()
        };
        for coordinator in coordinators {
            coordinator.shutdown().await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{MemoryStore, StaticProbe};
    use serde_json::json;

    #[tokio::test]
    async fn test_call_passes_value_through() {
        let coordinator = ResilienceCoordinator::builder("api").build().await;
        let value = coordinator
            .call(|_token| async { Ok::<_, CallError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_deferrable_queued_while_offline() {
        let probe = StaticProbe::new(false);
        let coordinator = ResilienceCoordinator::builder("api")
            .with_offline(
                OfflineConfig::default(),
                Arc::new(MemoryStore::new()),
                Arc::new(probe.clone()),
            )
            .build()
            .await;
        coordinator.check_connectivity().await;

        let options =
            ExecuteOptions::new().with_deferrable(Deferrable::new("create_order", json!({"n": 1})));
        let outcome = coordinator
            .execute(options, |_token| async { Ok::<_, CallError>(()) })
            .await
            .unwrap();

        assert!(outcome.is_queued());
        assert_eq!(coordinator.offline_queue().unwrap().pending(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_plain_execute_fails_without_deferrable() {
        let probe = StaticProbe::new(false);
        let coordinator = ResilienceCoordinator::builder("api")
            .with_retry_policy(RetryPolicy::no_retry())
            .with_offline(
                OfflineConfig::default(),
                Arc::new(MemoryStore::new()),
                Arc::new(probe.clone()),
            )
            .build()
            .await;
        coordinator.check_connectivity().await;

        let result = coordinator
            .execute::<(), _, _>(ExecuteOptions::new(), |_token| async {
                Err(CallError::network("unreachable"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(coordinator.offline_queue().unwrap().pending(), 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_reflects_circuit_state() {
        let coordinator = ResilienceCoordinator::builder("api").build().await;
        assert!(coordinator.health().healthy);

        coordinator.circuit_breaker().force_open().await;
        let report = coordinator.health();
        assert!(!report.healthy);
        assert!(!report.circuit.healthy);
        assert!(report.offline.is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let registry = CoordinatorRegistry::new();
        assert!(registry.is_empty());

        let api = ResilienceCoordinator::builder("api").build().await;
        let search = ResilienceCoordinator::builder("search").build().await;
        registry.register(api);
        registry.register(search);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("api").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.health().len(), 2);

        registry.shutdown_all().await;
        assert!(registry.is_empty());
    }
}
