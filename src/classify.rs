//! Error classification for retry decisions.
//!
//! Failed operations are sorted into coarse categories that drive the retry
//! policy. Classification prefers structured signals (an explicit variant or
//! a numeric status code) and falls back to keyword heuristics only for
//! unstructured error text.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CallError;

// ============================================================================
// Error Categories
// ============================================================================

/// Coarse category assigned to a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport-level failure: the dependency could not be reached.
    Network,
    /// The dependency itself failed (5xx-style).
    Server,
    /// The request was rejected as invalid (4xx-style).
    Client,
    /// An attempt exceeded its time budget.
    Timeout,
    /// Credentials or permissions were rejected.
    Auth,
    /// No signal allowed a more specific category.
    Unknown,
}

impl ErrorCategory {
    /// Stable lowercase name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Server => "server",
            Self::Client => "client",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorize a numeric status code.
///
/// 401 and 403 map to [`ErrorCategory::Auth`], other 4xx codes to
/// [`ErrorCategory::Client`], 5xx codes to [`ErrorCategory::Server`].
pub fn categorize_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        400..=499 => ErrorCategory::Client,
        500..=599 => ErrorCategory::Server,
        _ => ErrorCategory::Unknown,
    }
}

const TIMEOUT_KEYWORDS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const NETWORK_KEYWORDS: &[&str] = &[
    "network",
    "connection",
    "refused",
    "unreachable",
    "dns",
    "no such host",
    "host not found",
    "name not found",
    "offline",
    "socket",
    "broken pipe",
    "reset by peer",
];

const AUTH_KEYWORDS: &[&str] = &["unauthorized", "forbidden", "authentication"];

const SERVER_KEYWORDS: &[&str] = &[
    "internal server error",
    "bad gateway",
    "service unavailable",
];

/// Best-effort categorization of unstructured error text.
///
/// Timeout phrases win over network phrases so that "connection timed out"
/// classifies as a timeout rather than a generic network failure.
pub fn categorize_message(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if contains_any(TIMEOUT_KEYWORDS) {
        ErrorCategory::Timeout
    } else if contains_any(NETWORK_KEYWORDS) {
        ErrorCategory::Network
    } else if contains_any(AUTH_KEYWORDS) {
        ErrorCategory::Auth
    } else if contains_any(SERVER_KEYWORDS) {
        ErrorCategory::Server
    } else {
        ErrorCategory::Unknown
    }
}

// ============================================================================
// Classifier
// ============================================================================

type ClassifyFn = dyn Fn(&CallError) -> Option<ErrorCategory> + Send + Sync;

/// Pluggable error classifier.
///
/// Resolution order per error: the custom function (when installed), the
/// error's own structured signal, then message heuristics. A custom function
/// returning `None` falls through to the remaining stages, so it can refine
/// classification for a subset of errors without re-implementing the rest.
#[derive(Clone, Default)]
pub struct Classifier {
    custom: Option<Arc<ClassifyFn>>,
}

impl Classifier {
    /// Classifier using structured signals and heuristics only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier with a custom function consulted first.
    pub fn with_custom<F>(custom: F) -> Self
    where
        F: Fn(&CallError) -> Option<ErrorCategory> + Send + Sync + 'static,
    {
        Self {
            custom: Some(Arc::new(custom)),
        }
    }

    /// Classify an error into its category.
    pub fn classify(&self, error: &CallError) -> ErrorCategory {
        if let Some(custom) = &self.custom {
            if let Some(category) = custom(error) {
                return category;
            }
        }
        if let Some(category) = error.category_hint() {
            return category;
        }
        categorize_message(&error.to_string())
    }
}

impl fmt::Debug for Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("custom", &self.custom.as_ref().map(|_| "fn"))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
