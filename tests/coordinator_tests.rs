//! Coordinator Tests for Ballast
//!
//! Exercises the combined surface: retry chains recording a single circuit
//! outcome, offline capture on both the fast path and the failure path, the
//! circuit reopening on reconnect, and health reporting. Everything here
//! goes through the prelude, the way downstream code is expected to import.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ballast::offline::StaticProbe;
use ballast::prelude::*;

/// Routes coordinator logs through the test harness when RUST_LOG is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// 1. Circuit Outside, Retry Inside
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_retry_chain_records_one_circuit_outcome() {
    let coordinator = ResilienceCoordinator::builder("api")
        .with_retry_policy(
            RetryPolicy::new()
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
        .with_circuit_config(
            CircuitBreakerConfig::new()
                .with_minimum_requests(2)
                .with_failure_threshold(FailureThreshold::Rate(1.0)),
        )
        .build()
        .await;

    let calls = Arc::new(AtomicU32::new(0));
    for _ in 0..2 {
        let calls = calls.clone();
        let result = coordinator
            .call(move |_token| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CallError::status(500, "internal error"))
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { attempts: 3, .. })
        ));
    }

    // Six attempts ran, but the circuit saw two calls.
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    let metrics = coordinator.circuit_breaker().metrics();
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.failures, 2);
    assert_eq!(coordinator.circuit_breaker().state(), CircuitState::Open);

    // A rejected call never reaches the operation.
    let counted = calls.clone();
    let result = coordinator
        .call(move |_token| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CallError>(())
            }
        })
        .await;
    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_records_circuit_failure() {
    let coordinator = ResilienceCoordinator::builder("api")
        .with_retry_policy(RetryPolicy::no_retry())
        .with_total_timeout(Duration::from_secs(5))
        .build()
        .await;

    let result = coordinator
        .call(|_token| async {
            std::future::pending::<()>().await;
            Ok::<_, CallError>(())
        })
        .await;

    match result {
        Err(ResilienceError::TimedOut { elapsed, attempts }) => {
            assert!(elapsed >= Duration::from_secs(5));
            assert_eq!(attempts, 1);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let metrics = coordinator.circuit_breaker().metrics();
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.failures, 1);
    coordinator.shutdown().await;
}

// ============================================================================
// 2. Offline Capture
// ============================================================================

#[tokio::test]
async fn test_known_offline_skips_circuit_and_operation() {
    let probe = StaticProbe::new(false);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_offline(
            OfflineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;
    assert_eq!(
        coordinator.check_connectivity().await,
        ConnectionStatus::Offline
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let outcome = coordinator
        .execute(
            ExecuteOptions::new()
                .with_deferrable(Deferrable::new("create_order", json!({"sku": "a-1"}))),
            move |_token| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CallError>(())
                }
            },
        )
        .await
        .unwrap();

    let queue = coordinator.offline_queue().unwrap();
    assert_eq!(outcome.queued_id(), Some(queue.operations()[0].id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.circuit_breaker().metrics().total, 0);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_network_exhaustion_defers_when_connection_dropped() {
    init_tracing();
    let probe = StaticProbe::new(true);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_retry_policy(RetryPolicy::no_retry())
        .with_offline(
            OfflineConfig::new().with_poll_interval(Duration::from_secs(60)),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;
    assert_eq!(
        coordinator.check_connectivity().await,
        ConnectionStatus::Online
    );

    // The connection drops after the last probe, so the queue still
    // believes it is online and the call actually runs.
    probe.set_online(false);

    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let outcome = coordinator
        .execute(
            ExecuteOptions::new()
                .with_deferrable(Deferrable::new("create_order", json!({"sku": "a-1"}))),
            move |_token| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(CallError::network("connection reset by peer"))
                }
            },
        )
        .await
        .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.offline_queue().unwrap().pending(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_non_network_failure_propagates() {
    let probe = StaticProbe::new(true);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_retry_policy(RetryPolicy::no_retry())
        .with_offline(
            OfflineConfig::new().with_poll_interval(Duration::from_secs(60)),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;
    coordinator.check_connectivity().await;

    let result = coordinator
        .execute::<(), _, _>(
            ExecuteOptions::new()
                .with_deferrable(Deferrable::new("create_order", json!({"sku": "a-1"}))),
            |_token| async { Err(CallError::status(500, "internal error")) },
        )
        .await;

    // A server error is not a connectivity problem; it surfaces as-is.
    assert!(matches!(
        result,
        Err(ResilienceError::Exhausted { attempts: 1, .. })
    ));
    assert_eq!(coordinator.offline_queue().unwrap().pending(), 0);
    coordinator.shutdown().await;
}

// ============================================================================
// 3. Reconnect Behavior
// ============================================================================

#[tokio::test]
async fn test_reconnect_closes_open_circuit() {
    init_tracing();
    let probe = StaticProbe::new(true);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_offline(
            OfflineConfig::new().with_poll_interval(Duration::from_millis(25)),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;

    probe.set_online(false);
    assert_eq!(
        coordinator.check_connectivity().await,
        ConnectionStatus::Offline
    );
    coordinator.circuit_breaker().force_open().await;
    assert_eq!(coordinator.circuit_breaker().state(), CircuitState::Open);

    probe.set_online(true);
    for _ in 0..100 {
        if coordinator.circuit_breaker().state() == CircuitState::Closed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.circuit_breaker().state(), CircuitState::Closed);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_steady_online_polling_leaves_open_circuit_alone() {
    init_tracing();
    let probe = StaticProbe::new(true);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_circuit_config(
            CircuitBreakerConfig::new().with_reset_timeout(Duration::from_secs(60)),
        )
        .with_offline(
            OfflineConfig::new().with_poll_interval(Duration::from_millis(25)),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;

    assert_eq!(
        coordinator.check_connectivity().await,
        ConnectionStatus::Online
    );
    coordinator.circuit_breaker().force_open().await;

    // Connectivity never drops, so the stream of Online poll results must
    // leave the opened circuit on its own reset schedule.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(coordinator.circuit_breaker().state(), CircuitState::Open);
    coordinator.shutdown().await;
}

// ============================================================================
// 4. Health and Shutdown
// ============================================================================

#[tokio::test]
async fn test_health_includes_offline_component() {
    let probe = StaticProbe::new(true);
    let coordinator = ResilienceCoordinator::builder("api")
        .with_offline(
            OfflineConfig::new().with_poll_interval(Duration::from_secs(60)),
            Arc::new(MemoryStore::new()),
            Arc::new(probe.clone()),
        )
        .build()
        .await;
    coordinator.check_connectivity().await;

    let report = coordinator.health();
    assert!(report.healthy);
    assert!(report.retry.healthy);
    assert!(report.retry.message.contains("attempts"));
    let offline = report.offline.as_ref().unwrap();
    assert!(offline.healthy);
    assert!(offline.message.contains("pending"));

    probe.set_online(false);
    coordinator.check_connectivity().await;
    let report = coordinator.health();
    assert!(!report.healthy);
    assert!(!report.offline.unwrap().healthy);
    assert!(report.retry.healthy);
    assert!(report.circuit.healthy);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let coordinator = ResilienceCoordinator::builder("api")
        .with_offline(
            OfflineConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(StaticProbe::new(true)),
        )
        .build()
        .await;
    coordinator.shutdown().await;
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_version_is_exposed() {
    assert_eq!(ballast::version(), env!("CARGO_PKG_VERSION"));
}
