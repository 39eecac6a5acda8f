//! # Primary Store Error Classification
//!
//! Maps driver/server signals (Neo4j status codes, HTTP statuses, transport
//! error text) onto the three-way [`ErrorKind`] that drives retry and fallback
//! decisions, plus a finer [`ErrorCategory`] that is only used for logging and
//! status reporting.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ Server code /   │────▶│ ErrorClassifier │────▶│ ErrorKind +     │
//! │ status / text   │     │                 │     │ ErrorCategory   │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, StoreError};

/// Finer-grained failure categories for observability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Store unreachable (refused, DNS, no route, service unavailable)
    Network,
    /// Statement or connection timed out
    Timeout,
    /// Pool exhausted or server out of memory
    ResourceExhaustion,
    /// Server asked the client to slow down
    RateLimit,
    /// Deadlock or leader switch; the same statement may succeed later
    StateInconsistency,
    /// Credentials or database selection are wrong
    Configuration,
    /// Statement is malformed or violates a constraint
    Permanent,
    /// Nothing more specific is known
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::ResourceExhaustion => write!(f, "Resource Exhaustion"),
            ErrorCategory::RateLimit => write!(f, "Rate Limit"),
            ErrorCategory::StateInconsistency => write!(f, "State Inconsistency"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Permanent => write!(f, "Permanent"),
            ErrorCategory::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Result of classifying one store error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub category: ErrorCategory,
    pub is_retryable: bool,
    /// Stable code for log aggregation
    pub error_code: String,
}

/// Trait for error classification strategies
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &StoreError) -> ErrorClassification;

    fn classifier_name(&self) -> &'static str;
}

/// Classifier understanding Neo4j status codes and common transport failures
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardErrorClassifier;

impl StandardErrorClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify(&self, error: &StoreError) -> ErrorClassification {
        let category = error
            .code
            .as_deref()
            .and_then(category_for_server_code)
            .unwrap_or_else(|| category_for_message(&error.message, error.kind));

        ErrorClassification {
            kind: error.kind,
            category,
            is_retryable: error.kind.is_retryable(),
            error_code: error
                .code
                .clone()
                .unwrap_or_else(|| format!("STORE_{}", error.kind.to_string().to_uppercase())),
        }
    }

    fn classifier_name(&self) -> &'static str {
        "standard"
    }
}

/// Kind for a Neo4j status code such as `Neo.TransientError.Transaction.DeadlockDetected`
pub fn kind_for_server_code(code: &str) -> ErrorKind {
    if code == "Neo.TransientError.General.DatabaseUnavailable" {
        return ErrorKind::Unavailable;
    }
    if code.starts_with("Neo.TransientError.") || code.starts_with("Neo.DatabaseError.") {
        return ErrorKind::Transient;
    }
    if code == "Neo.ClientError.Cluster.NotALeader" {
        return ErrorKind::Transient;
    }
    if code.starts_with("Neo.ClientError.") {
        return ErrorKind::Fatal;
    }
    ErrorKind::Transient
}

/// Kind for an HTTP status returned by the store's transactional endpoint
pub fn kind_for_http_status(status: u16) -> ErrorKind {
    match status {
        401 | 403 | 400 | 404 | 422 => ErrorKind::Fatal,
        429 | 408 => ErrorKind::Transient,
        502 | 503 | 504 => ErrorKind::Unavailable,
        500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Fatal,
    }
}

/// Kind guessed from free-form driver text, used when no code is available
pub fn kind_for_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if ["refused", "unreachable", "no route", "service unavailable", "dns"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ErrorKind::Unavailable
    } else if ["unauthorized", "authentication", "syntax error", "invalid input"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        ErrorKind::Fatal
    } else {
        ErrorKind::Transient
    }
}

fn category_for_server_code(code: &str) -> Option<ErrorCategory> {
    if !code.starts_with("Neo.") {
        return None;
    }
    let category = if code.contains(".Security.") || code.ends_with("DatabaseNotFound") {
        ErrorCategory::Configuration
    } else if code.contains("DeadlockDetected") || code.contains("NotALeader") {
        ErrorCategory::StateInconsistency
    } else if code.contains("OutOfMemory") || code.contains("MemoryPoolOutOfMemory") {
        ErrorCategory::ResourceExhaustion
    } else if code.contains("Timeout") || code.contains("TimedOut") {
        ErrorCategory::Timeout
    } else if code.ends_with("DatabaseUnavailable") {
        ErrorCategory::Network
    } else if code.starts_with("Neo.ClientError.") {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Unknown
    };
    Some(category)
}

fn category_for_message(message: &str, kind: ErrorKind) -> ErrorCategory {
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("pool") || lower.contains("exhausted") {
        ErrorCategory::ResourceExhaustion
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorCategory::RateLimit
    } else if lower.contains("deadlock") {
        ErrorCategory::StateInconsistency
    } else {
        match kind {
            ErrorKind::Unavailable => ErrorCategory::Network,
            ErrorKind::Fatal => ErrorCategory::Permanent,
            ErrorKind::Transient => ErrorCategory::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_code_kinds() {
        assert_eq!(
            kind_for_server_code("Neo.TransientError.Transaction.DeadlockDetected"),
            ErrorKind::Transient
        );
        assert_eq!(
            kind_for_server_code("Neo.TransientError.General.DatabaseUnavailable"),
            ErrorKind::Unavailable
        );
        assert_eq!(
            kind_for_server_code("Neo.ClientError.Security.Unauthorized"),
            ErrorKind::Fatal
        );
        assert_eq!(
            kind_for_server_code("Neo.ClientError.Statement.SyntaxError"),
            ErrorKind::Fatal
        );
        assert_eq!(
            kind_for_server_code("Neo.ClientError.Cluster.NotALeader"),
            ErrorKind::Transient
        );
    }

    #[test]
    fn test_http_status_kinds() {
        assert_eq!(kind_for_http_status(401), ErrorKind::Fatal);
        assert_eq!(kind_for_http_status(429), ErrorKind::Transient);
        assert_eq!(kind_for_http_status(503), ErrorKind::Unavailable);
        assert_eq!(kind_for_http_status(500), ErrorKind::Transient);
    }

    #[test]
    fn test_message_kinds() {
        assert_eq!(
            kind_for_message("tcp connect error: Connection refused (os error 111)"),
            ErrorKind::Unavailable
        );
        assert_eq!(kind_for_message("operation timed out"), ErrorKind::Transient);
        assert_eq!(
            kind_for_message("Authentication failure for user"),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_classification_categories() {
        let classifier = StandardErrorClassifier::new();

        let deadlock = StoreError::transient("deadlock")
            .with_code("Neo.TransientError.Transaction.DeadlockDetected");
        let classification = classifier.classify(&deadlock);
        assert_eq!(classification.category, ErrorCategory::StateInconsistency);
        assert!(classification.is_retryable);
        assert_eq!(
            classification.error_code,
            "Neo.TransientError.Transaction.DeadlockDetected"
        );

        let pool = StoreError::transient("connection pool exhausted");
        let classification = classifier.classify(&pool);
        assert_eq!(classification.category, ErrorCategory::ResourceExhaustion);
        assert_eq!(classification.error_code, "STORE_TRANSIENT");

        let refused = StoreError::unavailable("connection refused");
        assert_eq!(classifier.classify(&refused).category, ErrorCategory::Network);

        let auth = StoreError::fatal("bad credentials")
            .with_code("Neo.ClientError.Security.Unauthorized");
        let classification = classifier.classify(&auth);
        assert_eq!(classification.category, ErrorCategory::Configuration);
        assert!(!classification.is_retryable);
    }
}
