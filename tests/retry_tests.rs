//! Retry Behavior Tests for Ballast
//!
//! Exercises the retry executor end to end: the backoff timeline, jitter
//! bounds, exhaustion and abort semantics, per-attempt and total timeouts,
//! and the cleanup hook. Timing-sensitive cases run on a paused clock so
//! they are exact and instant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use ballast::error::{CallError, ResilienceError};
use ballast::events::{EventListeners, ResilienceEvents};
use ballast::retry::{RetryExecutor, RetryPolicy, RetryStats, JITTER_FACTOR};

// ============================================================================
// Helpers
// ============================================================================

#[derive(Default)]
struct RetryLog {
    scheduled: Mutex<Vec<(u32, Duration)>>,
    succeeded: Mutex<Option<RetryStats>>,
    exhausted: Mutex<Option<RetryStats>>,
    aborted: Mutex<bool>,
}

#[async_trait]
impl ResilienceEvents for RetryLog {
    async fn on_retry_scheduled(&self, attempt: u32, delay: Duration, _error: &CallError) {
        self.scheduled.lock().push((attempt, delay));
    }

    async fn on_retry_success(&self, stats: &RetryStats) {
        *self.succeeded.lock() = Some(stats.clone());
    }

    async fn on_retry_exhausted(&self, stats: &RetryStats, _error: &CallError) {
        *self.exhausted.lock() = Some(stats.clone());
    }

    async fn on_retry_aborted(&self, _stats: &RetryStats) {
        *self.aborted.lock() = true;
    }
}

fn watched_executor(policy: RetryPolicy) -> (RetryExecutor, Arc<RetryLog>) {
    let log = Arc::new(RetryLog::default());
    let listeners = EventListeners::default();
    let _ = listeners.subscribe(log.clone());
    (RetryExecutor::new(policy).with_listeners(listeners), log)
}

// ============================================================================
// 1. Backoff Timeline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_timeline_without_jitter() {
    let (executor, log) = watched_executor(
        RetryPolicy::new()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(100))
            .with_backoff_factor(2.0)
            .with_jitter(false),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let outcome = executor
        .run(move |_cancel| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CallError::network("connection refused"))
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 4);
    assert_eq!(
        outcome.stats.total_delay,
        Duration::from_millis(100 + 200 + 400)
    );
    assert!(outcome.stats.elapsed >= Duration::from_millis(700));

    let scheduled = log.scheduled.lock().clone();
    assert_eq!(
        scheduled,
        vec![
            (2, Duration::from_millis(100)),
            (3, Duration::from_millis(200)),
            (4, Duration::from_millis(400)),
        ]
    );
    let success = log.succeeded.lock().clone().expect("success event");
    assert_eq!(success.attempts, 4);
    assert!(success.succeeded);
}

#[tokio::test]
async fn test_first_try_success_skips_backoff() {
    let (executor, log) = watched_executor(RetryPolicy::new());
    let value = assert_ok!(
        executor
            .execute(|_cancel| async { Ok::<_, CallError>(9) })
            .await
    );
    assert_eq!(value, 9);
    assert!(log.scheduled.lock().is_empty());
}

proptest! {
    // The exponential value is capped first; jitter then adds at most
    // JITTER_FACTOR of the capped value on top.
    #[test]
    fn prop_jittered_delay_stays_in_band(
        base_ms in 1u64..2_000,
        max_ms in 1u64..10_000,
        factor in 1.0f64..4.0,
        attempt in 1u32..12,
    ) {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(max_ms))
            .with_backoff_factor(factor);

        let capped = (Duration::from_millis(base_ms).as_secs_f64()
            * factor.powi(attempt as i32 - 1))
            .min(Duration::from_millis(max_ms).as_secs_f64());
        let delay = policy.delay_for_attempt(attempt).as_secs_f64();

        prop_assert!(delay >= capped - 1e-8);
        prop_assert!(delay <= capped * (1.0 + JITTER_FACTOR) + 1e-8);
    }
}

// ============================================================================
// 2. Exhaustion and Abort
// ============================================================================

#[tokio::test]
async fn test_exhaustion_surfaces_last_error() {
    let (executor, log) = watched_executor(
        RetryPolicy::new()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false),
    );

    let result: Result<(), _> = executor
        .execute(|_cancel| async { Err(CallError::status(502, "bad gateway")) })
        .await;

    match result {
        Err(ResilienceError::Exhausted {
            attempts, source, ..
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(source.status_code(), Some(502));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let stats = log.exhausted.lock().clone().expect("exhausted event");
    assert_eq!(stats.errors.len(), 3);
    assert!(!stats.succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_abort_during_backoff_stops_retrying() {
    let (executor, log) = watched_executor(
        RetryPolicy::new()
            .with_max_attempts(5)
            .with_base_delay(Duration::from_secs(10))
            .with_jitter(false),
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let outcome = executor
        .run_with_token(token, move |_cancel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallError::network("down"))
            }
        })
        .await;

    assert!(matches!(
        outcome.result,
        Err(ResilienceError::Aborted { attempts: 1 })
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(*log.aborted.lock());
}

// ============================================================================
// 3. Timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_counts_as_retryable_failure() {
    let executor = RetryExecutor::new(
        RetryPolicy::new()
            .with_attempt_timeout(Duration::from_secs(1))
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false),
    );

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let outcome = executor
        .run(move |_cancel| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok::<_, CallError>("done")
            }
        })
        .await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts(), 2);
    assert!(outcome.stats.errors[0].contains("exceeded"));
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_cuts_hung_attempt() {
    let executor =
        RetryExecutor::new(RetryPolicy::new()).with_total_timeout(Duration::from_secs(5));

    let outcome = executor
        .run(|_cancel| async {
            std::future::pending::<()>().await;
            Ok::<_, CallError>(())
        })
        .await;

    match outcome.result {
        Err(ResilienceError::TimedOut { attempts, elapsed }) => {
            assert_eq!(attempts, 1);
            assert!(elapsed >= Duration::from_secs(5));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_total_timeout_cuts_backoff() {
    let executor = RetryExecutor::new(
        RetryPolicy::new()
            .with_base_delay(Duration::from_secs(10))
            .with_jitter(false),
    )
    .with_total_timeout(Duration::from_secs(3));

    let outcome = executor
        .run(|_cancel| async { Err::<(), _>(CallError::network("down")) })
        .await;

    assert!(matches!(
        outcome.result,
        Err(ResilienceError::TimedOut { attempts: 1, .. })
    ));
}

// ============================================================================
// 4. Cleanup Hook
// ============================================================================

#[tokio::test]
async fn test_cleanup_sees_each_attempt_number() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = seen.clone();
    let executor = RetryExecutor::new(
        RetryPolicy::new()
            .with_base_delay(Duration::from_millis(1))
            .with_jitter(false),
    )
    .with_cleanup(move |attempt| hook.lock().push(attempt));

    let _ = executor
        .execute::<(), _, _>(|_cancel| async { Err(CallError::timeout("slow")) })
        .await;

    assert_eq!(*seen.lock(), vec![1, 2, 3]);
}
