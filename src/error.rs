//! Error types for the resilience layer.
//!
//! Two layers of errors exist side by side. [`CallError`] is produced by the
//! wrapped operations themselves and feeds classification; structured
//! variants carry their category directly, while [`CallError::Raw`] holds
//! foreign error text that is classified heuristically. [`ResilienceError`]
//! is what callers of this crate observe: retry exhaustion, timeouts,
//! aborts, and circuit rejections.

use std::time::Duration;

use thiserror::Error;

use crate::classify::{categorize_status, ErrorCategory};

/// Convenience result alias for coordinated calls.
pub type Result<T> = std::result::Result<T, ResilienceError>;

// ============================================================================
// Operation-Level Errors
// ============================================================================

/// Error produced by a wrapped operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Transport-level failure reaching the dependency.
    #[error("network error: {0}")]
    Network(String),

    /// The attempt exceeded a time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Status-coded response from the dependency.
    #[error("status {status}: {message}")]
    Status {
        /// Numeric status code (HTTP-style ranges).
        status: u16,
        /// Response or diagnostic text.
        message: String,
    },

    /// Credential or permission failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Caller-asserted category with free-form text.
    #[error("{message}")]
    Tagged {
        /// Category the caller vouches for.
        category: ErrorCategory,
        /// Diagnostic text.
        message: String,
    },

    /// Unstructured error text, classified heuristically.
    #[error("{0}")]
    Raw(String),
}

impl CallError {
    /// Network failure with the given message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Timeout with the given message.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Status-coded failure.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Authentication failure.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Failure with an explicit category.
    pub fn tagged(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::Tagged {
            category,
            message: message.into(),
        }
    }

    /// Unstructured failure text.
    pub fn raw(message: impl Into<String>) -> Self {
        Self::Raw(message.into())
    }

    /// Wrap a foreign error, keeping only its rendered message.
    pub fn other(error: impl std::fmt::Display) -> Self {
        Self::Raw(error.to_string())
    }

    /// Structured category carried by this error, if any.
    ///
    /// `Raw` errors return `None` and are left to the heuristics.
    pub fn category_hint(&self) -> Option<ErrorCategory> {
        match self {
            Self::Network(_) => Some(ErrorCategory::Network),
            Self::Timeout(_) => Some(ErrorCategory::Timeout),
            Self::Status { status, .. } => Some(categorize_status(*status)),
            Self::Auth(_) => Some(ErrorCategory::Auth),
            Self::Tagged { category, .. } => Some(*category),
            Self::Raw(_) => None,
        }
    }

    /// Numeric status code, when the error carries one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut => Self::Timeout(error.to_string()),
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::AddrNotAvailable
            | ErrorKind::UnexpectedEof => Self::Network(error.to_string()),
            ErrorKind::PermissionDenied => Self::Auth(error.to_string()),
            _ => Self::Raw(error.to_string()),
        }
    }
}

// ============================================================================
// Resilience Errors
// ============================================================================

/// Error surfaced by the resilience layer itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResilienceError {
    /// The circuit is open; the call was rejected without running the
    /// operation.
    #[error("circuit '{name}' is open, retry allowed in {retry_in:?}")]
    CircuitOpen {
        /// Name of the rejecting circuit.
        name: String,
        /// Time remaining until a probe is admitted.
        retry_in: Duration,
    },

    /// Every permitted attempt failed.
    #[error("exhausted after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Wall time from first attempt to finalization.
        elapsed: Duration,
        /// Error from the final attempt.
        source: CallError,
    },

    /// The total-operation timeout fired before any attempt succeeded.
    #[error("timed out after {elapsed:?} ({attempts} attempt(s) started)")]
    TimedOut {
        /// Wall time from first attempt to the timeout.
        elapsed: Duration,
        /// Attempts started before the timeout fired.
        attempts: u32,
    },

    /// The call was cancelled through its cancellation token.
    #[error("aborted during attempt {attempts}")]
    Aborted {
        /// Attempt in flight (or just finished) when the abort landed.
        attempts: u32,
    },
}

impl ResilienceError {
    /// True when the call was rejected by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The operation error behind this failure, if one exists.
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Attempts made before finalization, when the failure tracked them.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::TimedOut { attempts, .. }
            | Self::Aborted { attempts } => Some(*attempts),
            Self::CircuitOpen { .. } => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
