//! # Ballast - Resilience Primitives for Unreliable Dependencies
//!
//! Ballast keeps an application steady when a dependency it calls is slow,
//! failing, or unreachable. It composes three mechanisms behind one call
//! surface: retries with exponential backoff, a circuit breaker, and an
//! offline-first operation queue that captures work while the connection is
//! down and replays it when it returns.
//!
//! ## Core Concepts
//!
//! - **Retry**: [`RetryExecutor`](retry::RetryExecutor) re-runs a failed call
//!   with capped exponential backoff and jitter, guided by error categories
//! - **Circuit breaking**: [`CircuitBreaker`](circuit::CircuitBreaker) stops
//!   calling a dependency that keeps failing, then probes for recovery
//! - **Offline queueing**: [`OfflineQueue`](offline::OfflineQueue) persists
//!   deferred operations and replays them through registered handlers
//! - **Classification**: [`Classifier`](classify::Classifier) sorts errors
//!   into categories that drive the retry decision
//! - **Coordination**: [`ResilienceCoordinator`](coordinator::ResilienceCoordinator)
//!   wires the mechanisms together per dependency
//! - **Events**: [`ResilienceEvents`](events::ResilienceEvents) listeners
//!   observe every retry, state change, and queue mutation
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      ResilienceCoordinator                           │
//! │              (one per dependency, named, registered)                 │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                    offline? ───────┼─────── online
//!                       │            ▼
//!            ┌──────────────────┐   ┌──────────────────────────────────┐
//!            │   OfflineQueue   │   │          CircuitBreaker          │
//!            │ (capture, merge, │   │   (admit / reject, one outcome   │
//!            │  persist, sync)  │   │       per logical call)          │
//!            └──────────────────┘   └──────────────────────────────────┘
//!                       │                            │
//!            ┌──────────────────┐                    ▼
//!            │ Connectivity     │   ┌──────────────────────────────────┐
//!            │ Monitor (probe)  │   │          RetryExecutor           │
//!            └──────────────────┘   │  (attempts, backoff, timeouts)   │
//!                                   └──────────────────────────────────┘
//!                                                    │
//!                                                    ▼
//!                                   ┌──────────────────────────────────┐
//!                                   │           Dependency             │
//!                                   └──────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use ballast::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError> {
//!     let coordinator = ResilienceCoordinator::builder("orders-api")
//!         .with_retry_policy(RetryPolicy::aggressive())
//!         .with_circuit_config(CircuitBreakerConfig::sensitive())
//!         .build()
//!         .await;
//!
//!     let orders = coordinator
//!         .call(|_cancel| async {
//!             fetch_orders().await.map_err(CallError::other)
//!         })
//!         .await?;
//!
//!     println!("fetched {} orders", orders.len());
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! # Example
    //!
    //! ```rust,ignore
    //! use ballast::prelude::*;
    //!
    //! #[tokio::main]
    //! async fn main() -> Result<(), ResilienceError> {
    //!     let coordinator = ResilienceCoordinator::builder("api").build().await;
    //!     let value = coordinator
    //!         .call(|_cancel| async { Ok::<_, CallError>(1) })
    //!         .await?;
    //!     Ok(())
    //! }
    //! ```

    // Error handling
    pub use crate::error::{CallError, ResilienceError, Result};

    // Error classification
    pub use crate::classify::{Classifier, ErrorCategory};

    // Retry
    pub use crate::retry::{
        RetryExecutor, RetryOutcome, RetryPolicy, RetryPredicate, RetryStats,
    };

    // Circuit breaking
    pub use crate::circuit::{
        CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState, FailureThreshold,
    };

    // Offline queueing
    pub use crate::offline::{
        AssumeOnline, ConnectionStatus, ConnectivityProbe, JsonFileStore, MemoryStore,
        MergeStrategy, OfflineConfig, OfflineOperation, OfflineQueue, OfflineStore,
        OperationHandler, PayloadMerge, SyncReport,
    };

    // Coordination
    pub use crate::coordinator::{
        CallOutcome, CoordinatorRegistry, Deferrable, ExecuteOptions, HealthReport,
        ResilienceCoordinator, ResilienceCoordinatorBuilder,
    };

    // Events
    pub use crate::events::{EventListeners, ListenerId, ResilienceEvents, SharedListener};
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result alias.
///
/// [`CallError`](error::CallError) describes why one attempt against a
/// dependency failed; [`ResilienceError`](error::ResilienceError) describes
/// why the resilience machinery gave up on a whole call.
pub mod error;

/// Error classification into retryability categories.
///
/// Structured errors carry their category; everything else falls back to
/// status-code ranges and message heuristics, with an optional custom
/// classifier consulted first.
pub mod classify;

/// Event interface for observing the resilience mechanisms.
pub mod events;

// ============================================================================
// Resilience Mechanisms
// ============================================================================

/// Retry policies and the attempt-driving executor.
pub mod retry;

/// Circuit breaker with a sliding window of call outcomes.
pub mod circuit;

/// Offline-first operation queueing, connectivity monitoring, and
/// persistence backends.
pub mod offline;

// ============================================================================
// Composition
// ============================================================================

/// Per-dependency composition of the mechanisms, plus a registry for
/// looking coordinators up by name.
pub mod coordinator;

// ============================================================================
// Version Information
// ============================================================================

/// Returns the current version of Ballast.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
