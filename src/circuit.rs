//! Circuit breaker with a sliding window of call outcomes.
//!
//! The breaker admits or rejects calls based on its state. While closed it
//! records every outcome in a bounded window and opens when the failure
//! threshold is met. While open it rejects calls until the reset timeout
//! elapses, then admits a single probe; the probe's outcome decides whether
//! the circuit closes again or reopens. State advances lazily at admission
//! time, so no background timer is needed.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ResilienceError;
use crate::events::EventListeners;

// ============================================================================
// Circuit State
// ============================================================================

/// The three circuit states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through; outcomes are recorded.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// One probe call is allowed through to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// State name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// When the window counts as failing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureThreshold {
    /// Open when failures / total reaches this fraction.
    Rate(f64),
    /// Open when the window holds at least this many failures.
    Count(u32),
}

impl Default for FailureThreshold {
    fn default() -> Self {
        Self::Rate(0.5)
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes kept in the window.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Threshold at which the circuit opens.
    #[serde(default)]
    pub failure_threshold: FailureThreshold,

    /// Outcomes required in the window before the threshold is evaluated.
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u32,

    /// How long the circuit stays open before admitting a probe.
    #[serde(default = "default_reset_timeout")]
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

fn default_window_size() -> usize {
    16
}

fn default_minimum_requests() -> u32 {
    5
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            failure_threshold: FailureThreshold::default(),
            minimum_requests: default_minimum_requests(),
            reset_timeout: default_reset_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips early and probes quickly.
    pub fn sensitive() -> Self {
        Self {
            window_size: 16,
            failure_threshold: FailureThreshold::Rate(0.3),
            minimum_requests: 3,
            reset_timeout: Duration::from_secs(10),
        }
    }

    /// Tolerates sustained failure before tripping.
    pub fn relaxed() -> Self {
        Self {
            window_size: 32,
            failure_threshold: FailureThreshold::Rate(0.7),
            minimum_requests: 10,
            reset_timeout: Duration::from_secs(60),
        }
    }

    /// Set the window size (minimum 1).
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size.max(1);
        self
    }

    /// Set the failure threshold.
    pub fn with_failure_threshold(mut self, threshold: FailureThreshold) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the minimum outcomes before evaluation.
    pub fn with_minimum_requests(mut self, requests: u32) -> Self {
        self.minimum_requests = requests;
        self
    }

    /// Set the open-state reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Snapshot of a breaker's current condition.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CircuitMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Outcomes in the window.
    pub total: u32,
    /// Failed outcomes in the window.
    pub failures: u32,
    /// Failures divided by total, zero when the window is empty.
    pub failure_rate: f64,
    /// How long the circuit has been open, when open.
    pub open_for: Option<Duration>,
    /// Time remaining until a probe is admitted, when open.
    pub time_until_probe: Option<Duration>,
    /// Time since the last probe was admitted.
    pub since_last_probe: Option<Duration>,
    /// Time since the breaker last returned to closed.
    pub since_last_reset: Option<Duration>,
    /// Age of the oldest outcome in the window.
    pub window_span: Option<Duration>,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[derive(Debug)]
struct Sample {
    success: bool,
    at: Instant,
}

#[derive(Debug)]
struct CircuitRecord {
    state: CircuitState,
    window: VecDeque<Sample>,
    opened_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    last_reset_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transition {
    from: CircuitState,
    to: CircuitState,
}

enum Admission {
    Allowed {
        transition: Option<Transition>,
        probe: bool,
    },
    Rejected {
        retry_in: Duration,
    },
}

/// Releases a claimed half-open probe slot when the call future is dropped
/// before its outcome settles. The drop counts as a failed probe, so the
/// circuit reopens instead of latching half-open with the slot taken.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> ProbeGuard<'a> {
    fn new(breaker: &'a CircuitBreaker, armed: bool) -> Self {
        Self { breaker, armed }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let transition = {
            let mut record = self.breaker.record.lock();
            self.breaker.record_outcome(&mut record, true, false)
        };
        if let Some(transition) = transition {
            warn!(
                circuit = %self.breaker.name,
                "Probe call dropped before settling, circuit reopened"
            );
            // Drop cannot await; deliver the transition from a task.
            if !self.breaker.listeners.is_empty() {
                let listeners = self.breaker.listeners.clone();
                let metrics = self.breaker.metrics();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        listeners
                            .circuit_state_change(transition.from, transition.to, &metrics)
                            .await;
                    });
                }
            }
        }
    }
}

/// Circuit breaker guarding calls to one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    record: Mutex<CircuitRecord>,
    listeners: EventListeners,
}

impl CircuitBreaker {
    /// Breaker named after the dependency it guards.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            record: Mutex::new(CircuitRecord {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at: None,
                last_probe_at: None,
                last_reset_at: None,
                probe_in_flight: false,
            }),
            listeners: EventListeners::default(),
        }
    }

    /// Share a listener registry with this breaker.
    pub fn with_listeners(mut self, listeners: EventListeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// The dependency name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.record.lock().state
    }

    /// Snapshot of the breaker's condition.
    pub fn metrics(&self) -> CircuitMetrics {
        let record = self.record.lock();
        let now = Instant::now();
        let total = record.window.len() as u32;
        let failures = record.window.iter().filter(|s| !s.success).count() as u32;
        let failure_rate = if total == 0 {
            0.0
        } else {
            f64::from(failures) / f64::from(total)
        };
        let open_for = (record.state == CircuitState::Open)
            .then(|| record.opened_at.map(|at| now.saturating_duration_since(at)))
            .flatten();
        CircuitMetrics {
            state: record.state,
            total,
            failures,
            failure_rate,
            open_for,
            time_until_probe: open_for.map(|d| self.config.reset_timeout.saturating_sub(d)),
            since_last_probe: record
                .last_probe_at
                .map(|at| now.saturating_duration_since(at)),
            since_last_reset: record
                .last_reset_at
                .map(|at| now.saturating_duration_since(at)),
            window_span: record
                .window
                .front()
                .map(|s| now.saturating_duration_since(s.at)),
        }
    }

    /// Run a call through the breaker.
    ///
    /// An admitted call records exactly one outcome, success or failure.
    /// A rejected call records nothing and returns
    /// [`ResilienceError::CircuitOpen`] with the time until the next probe.
    /// A half-open probe whose future is dropped before it completes
    /// settles as a failure, reopening the circuit.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let admission = {
            let mut record = self.record.lock();
            self.admit(&mut record)
        };

        match admission {
            Admission::Rejected { retry_in } => {
                debug!(circuit = %self.name, retry_in = ?retry_in, "Call rejected, circuit open");
                Err(ResilienceError::CircuitOpen {
                    name: self.name.clone(),
                    retry_in,
                })
            }
            Admission::Allowed { transition, probe } => {
                let mut probe_guard = ProbeGuard::new(self, probe);
                if let Some(transition) = transition {
                    self.notify_transition(transition).await;
                }
                let result = operation().await;
                probe_guard.disarm();
                self.settle(probe, result.is_ok()).await;
                result
            }
        }
    }

    /// Force the circuit open, rejecting calls until reset or probe.
    pub async fn force_open(&self) {
        let transition = {
            let mut record = self.record.lock();
            if record.state == CircuitState::Open {
                None
            } else {
                let from = record.state;
                record.state = CircuitState::Open;
                record.opened_at = Some(Instant::now());
                record.probe_in_flight = false;
                Some(Transition {
                    from,
                    to: CircuitState::Open,
                })
            }
        };
        if let Some(transition) = transition {
            self.notify_transition(transition).await;
        }
    }

    /// Return the circuit to closed and clear the window.
    pub async fn reset(&self) {
        let transition = {
            let mut record = self.record.lock();
            let from = record.state;
            record.state = CircuitState::Closed;
            record.window.clear();
            record.opened_at = None;
            record.probe_in_flight = false;
            record.last_reset_at = Some(Instant::now());
            (from != CircuitState::Closed).then_some(Transition {
                from,
                to: CircuitState::Closed,
            })
        };
        if let Some(transition) = transition {
            self.notify_transition(transition).await;
        }
    }

    fn admit(&self, record: &mut CircuitRecord) -> Admission {
        match record.state {
            CircuitState::Closed => Admission::Allowed {
                transition: None,
                probe: false,
            },
            CircuitState::Open => {
                let now = Instant::now();
                let open_for = record
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if open_for >= self.config.reset_timeout {
                    record.state = CircuitState::HalfOpen;
                    record.probe_in_flight = true;
                    record.last_probe_at = Some(now);
                    Admission::Allowed {
                        transition: Some(Transition {
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                        }),
                        probe: true,
                    }
                } else {
                    Admission::Rejected {
                        retry_in: self.config.reset_timeout.saturating_sub(open_for),
                    }
                }
            }
            CircuitState::HalfOpen => {
                if record.probe_in_flight {
                    Admission::Rejected {
                        retry_in: Duration::ZERO,
                    }
                } else {
                    record.probe_in_flight = true;
                    record.last_probe_at = Some(Instant::now());
                    Admission::Allowed {
                        transition: None,
                        probe: true,
                    }
                }
            }
        }
    }

    async fn settle(&self, probe: bool, success: bool) {
        let transition = {
            let mut record = self.record.lock();
            self.record_outcome(&mut record, probe, success)
        };
        if let Some(transition) = transition {
            self.notify_transition(transition).await;
        }
    }

    fn record_outcome(
        &self,
        record: &mut CircuitRecord,
        probe: bool,
        success: bool,
    ) -> Option<Transition> {
        let now = Instant::now();

        if probe {
            record.probe_in_flight = false;
            return if success {
                record.state = CircuitState::Closed;
                record.window.clear();
                record.opened_at = None;
                record.last_reset_at = Some(now);
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Closed,
                })
            } else {
                record.state = CircuitState::Open;
                record.opened_at = Some(now);
                Some(Transition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            };
        }

        record.window.push_back(Sample { success, at: now });
        while record.window.len() > self.config.window_size {
            record.window.pop_front();
        }

        // Evaluate after every recorded outcome, not only failures; a
        // success can push the window past the minimum request count.
        if record.state == CircuitState::Closed && self.should_open(record) {
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
            return Some(Transition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
            });
        }
        None
    }

    fn should_open(&self, record: &CircuitRecord) -> bool {
        let total = record.window.len() as u32;
        if total < self.config.minimum_requests {
            return false;
        }
        let failures = record.window.iter().filter(|s| !s.success).count() as u32;
        match self.config.failure_threshold {
            FailureThreshold::Rate(rate) => {
                f64::from(failures) / f64::from(total) >= rate
            }
            FailureThreshold::Count(count) => failures >= count,
        }
    }

    async fn notify_transition(&self, transition: Transition) {
        match transition.to {
            CircuitState::Open => {
                warn!(circuit = %self.name, from = %transition.from, "Circuit opened")
            }
            CircuitState::HalfOpen => {
                info!(circuit = %self.name, "Circuit half-open, admitting probe")
            }
            CircuitState::Closed => {
                info!(circuit = %self.name, from = %transition.from, "Circuit closed")
            }
        }
        let metrics = self.metrics();
        self.listeners
            .circuit_state_change(transition.from, transition.to, &metrics)
            .await;
    }
}

// ============================================================================
// Tests
// ============================================================================
