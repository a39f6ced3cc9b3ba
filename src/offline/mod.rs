//! Offline-first operation queueing.
//!
//! When a dependency is unreachable, operations are captured as
//! [`OfflineOperation`] records and held in a bounded, persisted queue.
//! A [`ConnectivityMonitor`] watches reachability; when the connection
//! returns, the queue replays pending operations through registered
//! [`OperationHandler`]s in priority order. Replay is at-least-once: a
//! crash between a handler succeeding and the queue persisting can
//! deliver an operation twice, so handlers should be idempotent.

mod connectivity;
mod store;

pub use connectivity::{
    AssumeOnline, ConnectionStatus, ConnectivityMonitor, ConnectivityProbe, StaticProbe,
};
pub use store::{JsonFileStore, MemoryStore, OfflineStore, StoreError};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CallError;
use crate::events::EventListeners;

// ============================================================================
// Offline Operation
// ============================================================================

/// One deferred operation awaiting replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOperation {
    /// Unique id assigned at creation.
    pub id: Uuid,
    /// Handler key; operations are routed to handlers by this type.
    #[serde(rename = "type")]
    pub op_type: String,
    /// Operation payload, opaque to the queue.
    pub payload: Value,
    /// When the operation was enqueued.
    pub created_at: DateTime<Utc>,
    /// Replay attempts made so far.
    #[serde(default)]
    pub attempts: u32,
    /// When the last replay attempt ran.
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Higher values sync earlier and survive eviction longer.
    #[serde(default)]
    pub priority: i32,
    /// Whether this operation may be merged with others of its type.
    #[serde(default)]
    pub mergeable: bool,
    /// Free-form tags carried with the operation.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl OfflineOperation {
    /// Operation of the given type with a payload.
    pub fn new(op_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            op_type: op_type.into(),
            payload,
            created_at: Utc::now(),
            attempts: 0,
            last_attempt: None,
            priority: 0,
            mergeable: false,
            metadata: HashMap::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the operation as mergeable with others of its type.
    pub fn with_mergeable(mut self, mergeable: bool) -> Self {
        self.mergeable = mergeable;
        self
    }

    /// Attach a metadata tag.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

// ============================================================================
// Merge Strategy
// ============================================================================

/// Combines the payloads of merged operations.
pub trait PayloadMerge: Send + Sync {
    /// Fold `next` into `previous`, returning the combined payload.
    fn combine(&self, previous: &Value, next: &Value) -> Value;
}

/// How mergeable operations of the same type are collapsed at enqueue.
#[derive(Clone, Default)]
pub enum MergeStrategy {
    /// The newest operation replaces older ones of its type.
    #[default]
    LatestOnly,
    /// Nothing is merged; every operation is kept.
    KeepAll,
    /// Older payloads are folded into the newest via [`PayloadMerge`].
    Combine(Arc<dyn PayloadMerge>),
}

impl fmt::Debug for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatestOnly => f.write_str("LatestOnly"),
            Self::KeepAll => f.write_str("KeepAll"),
            Self::Combine(_) => f.write_str("Combine(..)"),
        }
    }
}

/// Replays one type of deferred operation against the real dependency.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Replay the operation. Errors leave it queued for the next sync.
    async fn handle(&self, operation: &OfflineOperation) -> Result<(), CallError>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the offline queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Most operations held at once; excess evicts the lowest priority.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Operations older than this are dropped when the queue is loaded.
    #[serde(default = "default_max_operation_age")]
    #[serde(with = "humantime_serde")]
    pub max_operation_age: Duration,

    /// Connectivity poll interval.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Sync automatically when the connection returns.
    #[serde(default = "default_true")]
    pub auto_sync: bool,

    /// Prefix for the persistence key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How mergeable operations are collapsed.
    #[serde(skip)]
    pub merge_strategy: MergeStrategy,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_operation_age() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

fn default_key_prefix() -> String {
    "offline".to_string()
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_operation_age: default_max_operation_age(),
            poll_interval: default_poll_interval(),
            auto_sync: default_true(),
            key_prefix: default_key_prefix(),
            merge_strategy: MergeStrategy::default(),
        }
    }
}

impl OfflineConfig {
    /// Configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue capacity (minimum 1).
    pub fn with_max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size.max(1);
        self
    }

    /// Set the maximum operation age.
    pub fn with_max_operation_age(mut self, age: Duration) -> Self {
        self.max_operation_age = age;
        self
    }

    /// Set the connectivity poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Enable or disable automatic sync on reconnect.
    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    /// Set the persistence key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the merge strategy.
    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge_strategy = strategy;
        self
    }
}

// ============================================================================
// Sync Reporting
// ============================================================================

const QUEUE_BLOB_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct QueueBlob {
    version: u32,
    #[serde(default)]
    operations: Vec<OfflineOperation>,
}

/// One operation that failed to replay during a sync.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    /// The operation, with its attempt count already bumped.
    pub operation: OfflineOperation,
    /// Why the replay failed.
    pub error: CallError,
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Ids of operations replayed and removed.
    pub synced: Vec<Uuid>,
    /// Operations that failed and remain queued.
    pub failed: Vec<SyncFailure>,
}

impl SyncReport {
    /// Operations replayed successfully.
    pub fn synced_count(&self) -> usize {
        self.synced.len()
    }

    /// Operations that failed.
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Operations the pass attempted.
    pub fn attempted(&self) -> usize {
        self.synced.len() + self.failed.len()
    }

    /// True when nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Snapshot of the queue's current condition.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    /// Operations waiting to sync.
    pub pending: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Last observed connection status.
    pub status: ConnectionStatus,
    /// Whether a sync pass is running.
    pub syncing: bool,
    /// Whether sync runs automatically on reconnect.
    pub auto_sync: bool,
    /// Age of the oldest pending operation.
    pub oldest_age: Option<Duration>,
}

// ============================================================================
// Offline Queue
// ============================================================================

/// Bounded, persisted queue of deferred operations.
pub struct OfflineQueue {
    config: OfflineConfig,
    store: Arc<dyn OfflineStore>,
    monitor: Arc<ConnectivityMonitor>,
    entries: Mutex<Vec<OfflineOperation>>,
    handlers: RwLock<HashMap<String, Arc<dyn OperationHandler>>>,
    syncing: AtomicBool,
    listeners: EventListeners,
    cancel: CancellationToken,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Clears the syncing flag when the pass ends, however it ends.
struct SyncGuard<'a>(&'a AtomicBool);

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    /// Queue over the given store, watching connectivity via the probe.
    pub fn new(
        config: OfflineConfig,
        store: Arc<dyn OfflineStore>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Arc<Self> {
        Self::with_listeners(config, store, probe, EventListeners::default())
    }

    /// Like [`new`](Self::new) with a shared listener registry.
    pub fn with_listeners(
        config: OfflineConfig,
        store: Arc<dyn OfflineStore>,
        probe: Arc<dyn ConnectivityProbe>,
        listeners: EventListeners,
    ) -> Arc<Self> {
        let monitor = Arc::new(
            ConnectivityMonitor::new(probe, config.poll_interval)
                .with_listeners(listeners.clone()),
        );
        Arc::new(Self {
            config,
            store,
            monitor,
            entries: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            syncing: AtomicBool::new(false),
            listeners,
            cancel: CancellationToken::new(),
            watcher: Mutex::new(None),
        })
    }

    /// The queue's configuration.
    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    /// Route operations of `op_type` to `handler` during sync.
    pub fn register_handler(&self, op_type: impl Into<String>, handler: Arc<dyn OperationHandler>) {
        self.handlers.write().insert(op_type.into(), handler);
    }

    /// Load persisted state, start connectivity polling, and begin
    /// reacting to reconnects. Calling twice is a no-op for the
    /// background pieces.
    pub async fn start(self: &Arc<Self>) {
        self.load().await;
        self.spawn_watcher();
        self.monitor.start();
    }

    /// Add an operation to the queue, returning its id.
    ///
    /// Mergeable operations are collapsed per the configured strategy.
    /// When the queue is over capacity the lowest-priority operation is
    /// evicted, oldest first among ties. The queue is persisted before
    /// this returns.
    pub async fn enqueue(&self, mut operation: OfflineOperation) -> Uuid {
        let mut displaced = Vec::new();
        {
            let mut entries = self.entries.lock();

            if operation.mergeable {
                match &self.config.merge_strategy {
                    MergeStrategy::KeepAll => {}
                    MergeStrategy::LatestOnly => {
                        let (absorbed, kept): (Vec<_>, Vec<_>) = entries
                            .drain(..)
                            .partition(|op| op.mergeable && op.op_type == operation.op_type);
                        *entries = kept;
                        displaced.extend(absorbed);
                    }
                    MergeStrategy::Combine(merger) => {
                        let (mut absorbed, kept): (Vec<_>, Vec<_>) = entries
                            .drain(..)
                            .partition(|op| op.mergeable && op.op_type == operation.op_type);
                        *entries = kept;
                        if let Some((first, rest)) = {
                            absorbed.sort_by_key(|op| op.created_at);
                            absorbed.split_first()
                        } {
                            let mut folded = first.payload.clone();
                            for older in rest {
                                folded = merger.combine(&folded, &older.payload);
                            }
                            operation.payload = merger.combine(&folded, &operation.payload);
                        }
                        displaced.extend(absorbed);
                    }
                }
            }

            entries.push(operation.clone());
            while entries.len() > self.config.max_queue_size {
                match lowest_priority_index(&entries) {
                    Some(index) => displaced.push(entries.remove(index)),
                    None => break,
                }
            }
        }

        self.persist().await;
        debug!(id = %operation.id, op_type = %operation.op_type, "Operation queued");
        self.listeners.operation_queued(&operation).await;
        for dropped in &displaced {
            self.listeners.operation_dequeued(dropped).await;
        }
        operation.id
    }

    /// Replay pending operations through their handlers.
    ///
    /// A no-op returning an empty report unless the last observed status
    /// is online and no other sync pass is running. Operations are
    /// replayed highest priority first, newest first among ties; failures
    /// stay queued with their attempt count bumped.
    pub async fn sync(&self) -> SyncReport {
        if self.monitor.status() != ConnectionStatus::Online {
            debug!(status = %self.monitor.status(), "Sync skipped, not online");
            return SyncReport::default();
        }
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync skipped, already in progress");
            return SyncReport::default();
        }
        // Released on drop, so a panicking handler or a dropped sync
        // future cannot wedge the flag and block every later pass.
        let _running = SyncGuard(&self.syncing);
        self.sync_inner().await
    }

    /// Operations waiting to sync.
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    /// Snapshot of the queued operations.
    pub fn operations(&self) -> Vec<OfflineOperation> {
        self.entries.lock().clone()
    }

    /// True while a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Last observed connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.monitor.status()
    }

    /// Probe connectivity immediately.
    pub async fn check_now(&self) -> ConnectionStatus {
        self.monitor.check_now().await
    }

    /// Receiver observing connection status changes.
    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<ConnectionStatus> {
        self.monitor.subscribe()
    }

    /// Drop every queued operation, returning how many were dropped.
    ///
    /// The persisted blob is deleted rather than rewritten empty.
    pub async fn clear(&self) -> usize {
        let drained: Vec<OfflineOperation> = {
            let mut entries = self.entries.lock();
            entries.drain(..).collect()
        };
        if drained.is_empty() {
            return 0;
        }
        let key = self.storage_key();
        if let Err(error) = self.store.remove(&key).await {
            warn!(error = %error, key = %key, "Failed to remove offline queue blob");
        }
        for dropped in &drained {
            self.listeners.operation_dequeued(dropped).await;
        }
        info!(count = drained.len(), "Offline queue cleared");
        drained.len()
    }

    /// Snapshot of the queue's condition.
    pub fn metrics(&self) -> QueueMetrics {
        let entries = self.entries.lock();
        let now = Utc::now();
        let oldest_age = entries
            .iter()
            .map(|op| now.signed_duration_since(op.created_at))
            .max()
            .and_then(|age| age.to_std().ok());
        QueueMetrics {
            pending: entries.len(),
            capacity: self.config.max_queue_size,
            status: self.monitor.status(),
            syncing: self.syncing.load(Ordering::SeqCst),
            auto_sync: self.config.auto_sync,
            oldest_age,
        }
    }

    /// Stop background tasks and persist a final snapshot. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.watcher.lock().take() {
            handle.abort();
        }
        self.monitor.stop();
        self.persist().await;
        debug!("Offline queue shut down");
    }

    async fn load(&self) {
        let key = self.storage_key();
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(error) => {
                warn!(error = %error, key = %key, "Failed to read persisted queue");
                return;
            }
        };
        let blob: QueueBlob = match serde_json::from_str(&raw) {
            Ok(blob) => blob,
            Err(error) => {
                warn!(error = %error, "Persisted queue is corrupt, starting empty");
                return;
            }
        };
        if blob.version != QUEUE_BLOB_VERSION {
            warn!(version = blob.version, "Unsupported queue version, starting empty");
            return;
        }

        let now = Utc::now();
        let max_age = self.config.max_operation_age;
        let (mut fresh, expired): (Vec<_>, Vec<_>) =
            blob.operations.into_iter().partition(|op| {
                now.signed_duration_since(op.created_at)
                    .to_std()
                    .map(|age| age <= max_age)
                    .unwrap_or(true)
            });

        let mut dropped = expired;
        while fresh.len() > self.config.max_queue_size {
            match lowest_priority_index(&fresh) {
                Some(index) => dropped.push(fresh.remove(index)),
                None => break,
            }
        }

        let restored = fresh.len();
        *self.entries.lock() = fresh;

        if !dropped.is_empty() {
            self.persist().await;
            for op in &dropped {
                self.listeners.operation_dequeued(op).await;
            }
        }
        if restored > 0 || !dropped.is_empty() {
            info!(restored, dropped = dropped.len(), "Restored offline queue");
        }
    }

    async fn sync_inner(&self) -> SyncReport {
        let mut batch = self.entries.lock().clone();
        if batch.is_empty() {
            return SyncReport::default();
        }
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at.cmp(&a.created_at))
        });

        info!(pending = batch.len(), "Sync started");
        self.listeners.sync_started(batch.len()).await;

        let mut report = SyncReport::default();
        for operation in batch {
            let handler = self.handlers.read().get(&operation.op_type).cloned();
            let result = match handler {
                Some(handler) => handler.handle(&operation).await,
                None => Err(CallError::raw(format!(
                    "no handler registered for operation type '{}'",
                    operation.op_type
                ))),
            };
            match result {
                Ok(()) => {
                    self.entries.lock().retain(|op| op.id != operation.id);
                    debug!(id = %operation.id, op_type = %operation.op_type, "Operation synced");
                    self.listeners.operation_synced(&operation).await;
                    report.synced.push(operation.id);
                }
                Err(error) => {
                    let mut operation = operation;
                    operation.attempts += 1;
                    operation.last_attempt = Some(Utc::now());
                    {
                        let mut entries = self.entries.lock();
                        if let Some(live) = entries.iter_mut().find(|op| op.id == operation.id) {
                            live.attempts = operation.attempts;
                            live.last_attempt = operation.last_attempt;
                        }
                    }
                    warn!(
                        id = %operation.id,
                        op_type = %operation.op_type,
                        attempts = operation.attempts,
                        error = %error,
                        "Operation sync failed"
                    );
                    self.listeners.sync_failed(&operation, &error).await;
                    report.failed.push(SyncFailure { operation, error });
                }
            }
        }

        self.persist().await;
        info!(
            synced = report.synced_count(),
            failed = report.failed_count(),
            "Sync completed"
        );
        self.listeners.sync_completed(&report).await;
        report
    }

    async fn persist(&self) {
        let blob = {
            let entries = self.entries.lock();
            QueueBlob {
                version: QUEUE_BLOB_VERSION,
                operations: entries.clone(),
            }
        };
        let key = self.storage_key();
        let encoded = match serde_json::to_string(&blob) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(error = %error, "Failed to encode offline queue");
                return;
            }
        };
        // Persistence failures keep the in-memory queue authoritative.
        if let Err(error) = self.store.set(&key, &encoded).await {
            warn!(error = %error, key = %key, "Failed to persist offline queue");
        }
    }

    fn spawn_watcher(self: &Arc<Self>) {
        let mut guard = self.watcher.lock();
        if guard.is_some() {
            return;
        }
        let queue = Arc::downgrade(self);
        let mut rx = self.monitor.subscribe();
        // The monitor publishes every poll result, not only changes; sync
        // must run when the status becomes online, not on every tick.
        let mut seen = *rx.borrow_and_update();
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
                        let Some(queue) = queue.upgrade() else { break };
                        if status == ConnectionStatus::Online
                            && previous != ConnectionStatus::Online
                            && queue.config.auto_sync
                        {
                            let report = queue.sync().await;
                            if report.attempted() > 0 {
                                debug!(
                                    synced = report.synced_count(),
                                    failed = report.failed_count(),
                                    "Auto-sync on reconnect"
                                );
                            }
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
        });
        *guard = Some(handle);
    }

    fn storage_key(&self) -> String {
        format!("{}_queue", self.config.key_prefix)
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("pending", &self.pending())
            .field("status", &self.status())
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

fn lowest_priority_index(entries: &[OfflineOperation]) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        })
        .map(|(index, _)| index)
}

// ============================================================================
// Tests
// ============================================================================
