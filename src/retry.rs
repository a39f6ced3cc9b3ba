//! Retry policies and the attempt-driving executor.
//!
//! [`RetryPolicy`] is pure decision logic: whether a failed attempt should
//! be retried and how long to wait before the next one. [`RetryExecutor`]
//! drives one logical call across attempts, owning per-attempt timeouts, an
//! optional total timeout, cancellation, and a cleanup hook that runs after
//! every attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::classify::{Classifier, ErrorCategory};
use crate::error::{CallError, ResilienceError};
use crate::events::EventListeners;

/// Fraction of the computed delay that jitter may add on top.
pub const JITTER_FACTOR: f64 = 0.3;

// ============================================================================
// Retry Policy Configuration
// ============================================================================

/// Custom retry predicate, consulted instead of the category rule.
///
/// Receives the error and the attempt number that just failed.
#[derive(Clone)]
pub struct RetryPredicate(Arc<dyn Fn(&CallError, u32) -> bool + Send + Sync>);

impl RetryPredicate {
    /// Wrap a decision function.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&CallError, u32) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Evaluate the predicate.
    pub fn evaluate(&self, error: &CallError, attempt: u32) -> bool {
        (self.0)(error, attempt)
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Configuration for retry behavior. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first (minimum 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Cap applied to the computed backoff delay.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Growth factor: delay for attempt n is base * factor^(n-1).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Add a uniform random amount in [0, 0.3 * delay] to each delay.
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Timeout applied to each individual attempt.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,

    /// Categories retried when no custom predicate is installed.
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<ErrorCategory>,

    /// Classifier used to categorize errors.
    #[serde(skip)]
    pub classifier: Classifier,

    /// Custom predicate replacing the category rule entirely.
    #[serde(skip)]
    pub predicate: Option<RetryPredicate>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_retry_on() -> Vec<ErrorCategory> {
    vec![
        ErrorCategory::Network,
        ErrorCategory::Server,
        ErrorCategory::Timeout,
    ]
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            jitter: true,
            attempt_timeout: None,
            retry_on: default_retry_on(),
            classifier: Classifier::default(),
            predicate: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries (a single attempt).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Many quick attempts for critical operations.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.5,
            ..Default::default()
        }
    }

    /// Few patient attempts for less critical operations.
    pub fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            ..Default::default()
        }
    }

    /// Set the maximum number of attempts (minimum 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the delay before the second attempt.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff growth factor (minimum 1.0).
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Replace the retryable category set.
    pub fn with_retry_on(mut self, categories: Vec<ErrorCategory>) -> Self {
        self.retry_on = categories;
        self
    }

    /// Install a classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Install a custom retry predicate.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Decide whether the attempt that just failed should be retried.
    ///
    /// `attempt` is the number of the attempt that failed, starting at 1.
    pub fn should_retry(&self, error: &CallError, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate.evaluate(error, attempt);
        }
        let category = self.classifier.classify(error);
        self.retry_on.contains(&category)
    }

    /// Delay to wait after the given attempt failed.
    ///
    /// The exponential value is capped at `max_delay` first; jitter is then
    /// added on top of the capped value, so a jittered delay may exceed the
    /// cap by at most [`JITTER_FACTOR`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64);
        let raw_secs =
            self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped_secs = raw_secs.min(self.max_delay.as_secs_f64());
        let capped = Duration::from_secs_f64(capped_secs.max(0.0));

        if self.jitter {
            let extra = capped.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_FACTOR));
            capped + extra
        } else {
            capped
        }
    }
}

// ============================================================================
// Retry Statistics
// ============================================================================

/// Statistics for one driven call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Time spent sleeping between attempts.
    pub total_delay: Duration,
    /// Wall time from first attempt to finalization.
    pub elapsed: Duration,
    /// Whether the call ultimately succeeded.
    pub succeeded: bool,
    /// Rendered error from each failed attempt, oldest first.
    pub errors: Vec<String>,
}

/// Result of a driven call, with statistics attached.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The final result.
    pub result: Result<T, ResilienceError>,
    /// Statistics for the call.
    pub stats: RetryStats,
}

impl<T> RetryOutcome<T> {
    /// True when the call succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Attempts made.
    pub fn attempts(&self) -> u32 {
        self.stats.attempts
    }

    /// Discard the statistics, keeping the result.
    pub fn into_result(self) -> Result<T, ResilienceError> {
        self.result
    }
}

// ============================================================================
// Retry Executor
// ============================================================================

/// Hook run after every attempt, receiving the attempt number.
#[derive(Clone)]
pub struct CleanupHook(Arc<dyn Fn(u32) + Send + Sync>);

impl CleanupHook {
    /// Wrap a cleanup function.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    fn run(&self, attempt: u32) {
        (self.0)(attempt);
    }
}

impl fmt::Debug for CleanupHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CleanupHook(..)")
    }
}

enum AttemptEnd<T> {
    Finished(Result<T, CallError>),
    Aborted,
    Deadline,
}

/// Drives one logical call across multiple attempts.
///
/// The executor is cheap to clone; clones share the policy, cleanup hook,
/// and listener registry.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    label: String,
    policy: RetryPolicy,
    total_timeout: Option<Duration>,
    cleanup: Option<CleanupHook>,
    listeners: EventListeners,
}

impl RetryExecutor {
    /// Executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            label: "retry".to_string(),
            policy,
            total_timeout: None,
            cleanup: None,
            listeners: EventListeners::default(),
        }
    }

    /// Label used in logs, usually the owning dependency's name.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Timeout for the whole call, racing every attempt and backoff sleep.
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Hook run after every attempt, success or failure.
    pub fn with_cleanup<F>(mut self, hook: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.cleanup = Some(CleanupHook::new(hook));
        self
    }

    /// Share a listener registry with this executor.
    pub fn with_listeners(mut self, listeners: EventListeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// The policy driving this executor.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive a call to completion, returning the result with statistics.
    ///
    /// The operation receives a fresh child token per attempt; it is
    /// cancelled when the attempt ends for any reason.
    pub async fn run<T, F, Fut>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.run_with_token(CancellationToken::new(), operation).await
    }

    /// Like [`run`](Self::run), with a caller-held token for external abort.
    ///
    /// Cancelling the token cancels the in-flight attempt and suppresses all
    /// further retries for this call only.
    pub async fn run_with_token<T, F, Fut>(
        &self,
        cancel: CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let started = Instant::now();
        let deadline = self.total_timeout.map(|timeout| started + timeout);
        let mut stats = RetryStats::default();
        let mut attempt: u32 = 1;

        loop {
            stats.attempts = attempt;
            let attempt_token = cancel.child_token();
            trace!(label = %self.label, attempt, "Starting attempt");

            let end = {
                let op_future = operation(attempt_token.clone());
                let guarded = async {
                    match self.policy.attempt_timeout {
                        Some(limit) => match tokio::time::timeout(limit, op_future).await {
                            Ok(result) => result,
                            Err(_) => Err(CallError::timeout(format!(
                                "attempt {attempt} exceeded {limit:?}"
                            ))),
                        },
                        None => op_future.await,
                    }
                };
                tokio::select! {
                    result = guarded => AttemptEnd::Finished(result),
                    () = cancel.cancelled() => AttemptEnd::Aborted,
                    () = wait_for_deadline(deadline) => AttemptEnd::Deadline,
                }
            };

            // The attempt is over one way or another; signal any cooperative
            // work still holding the attempt token.
            attempt_token.cancel();
            if let Some(cleanup) = &self.cleanup {
                cleanup.run(attempt);
            }

            match end {
                AttemptEnd::Finished(Ok(value)) => {
                    stats.succeeded = true;
                    stats.elapsed = started.elapsed();
                    debug!(
                        label = %self.label,
                        attempts = stats.attempts,
                        elapsed = ?stats.elapsed,
                        "Operation succeeded"
                    );
                    self.listeners.retry_success(&stats).await;
                    return RetryOutcome {
                        result: Ok(value),
                        stats,
                    };
                }
                AttemptEnd::Finished(Err(error)) => {
                    stats.errors.push(error.to_string());

                    if !self.policy.should_retry(&error, attempt) {
                        stats.elapsed = started.elapsed();
                        warn!(
                            label = %self.label,
                            attempts = attempt,
                            elapsed = ?stats.elapsed,
                            error = %error,
                            "Retry budget exhausted"
                        );
                        self.listeners.retry_exhausted(&stats, &error).await;
                        return RetryOutcome {
                            result: Err(ResilienceError::Exhausted {
                                attempts: attempt,
                                elapsed: stats.elapsed,
                                source: error,
                            }),
                            stats,
                        };
                    }

                    let delay = self.policy.delay_for_attempt(attempt);
                    debug!(
                        label = %self.label,
                        attempt = attempt + 1,
                        delay = ?delay,
                        error = %error,
                        "Scheduling retry"
                    );
                    self.listeners
                        .retry_scheduled(attempt + 1, delay, &error)
                        .await;
                    stats.total_delay += delay;

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => {
                            stats.elapsed = started.elapsed();
                            debug!(label = %self.label, attempts = attempt, "Call aborted during backoff");
                            self.listeners.retry_aborted(&stats).await;
                            return RetryOutcome {
                                result: Err(ResilienceError::Aborted { attempts: attempt }),
                                stats,
                            };
                        }
                        () = wait_for_deadline(deadline) => {
                            stats.elapsed = started.elapsed();
                            warn!(
                                label = %self.label,
                                attempts = attempt,
                                elapsed = ?stats.elapsed,
                                "Total timeout reached during backoff"
                            );
                            return RetryOutcome {
                                result: Err(ResilienceError::TimedOut {
                                    elapsed: stats.elapsed,
                                    attempts: attempt,
                                }),
                                stats,
                            };
                        }
                    }
                    attempt += 1;
                }
                AttemptEnd::Aborted => {
                    stats.elapsed = started.elapsed();
                    debug!(label = %self.label, attempts = attempt, "Call aborted");
                    self.listeners.retry_aborted(&stats).await;
                    return RetryOutcome {
                        result: Err(ResilienceError::Aborted { attempts: attempt }),
                        stats,
                    };
                }
                AttemptEnd::Deadline => {
                    stats.elapsed = started.elapsed();
                    warn!(
                        label = %self.label,
                        attempts = attempt,
                        elapsed = ?stats.elapsed,
                        "Total timeout reached mid-attempt"
                    );
                    return RetryOutcome {
                        result: Err(ResilienceError::TimedOut {
                            elapsed: stats.elapsed,
                            attempts: attempt,
                        }),
                        stats,
                    };
                }
            }
        }
    }

    /// Drive a call to completion, discarding the statistics.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.run(operation).await.into_result()
    }

    /// Like [`execute`](Self::execute), with a caller-held abort token.
    pub async fn execute_with_token<T, F, Fut>(
        &self,
        cancel: CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        self.run_with_token(cancel, operation).await.into_result()
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
