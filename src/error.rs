//! Error types for the Kurultai resilience core.
//!
//! Primary-store failures are classified into an [`ErrorKind`] so the resilient
//! connection can decide between retrying, failing fast and falling back without
//! inspecting driver-specific error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigurationError;

/// Failure class of a primary-store error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The store cannot be reached at all (refused, no driver, no credentials)
    Unavailable,
    /// A retry may succeed (timeout, pool exhaustion, reset, transient server error)
    Transient,
    /// Retrying cannot help (authentication, malformed statement)
    Fatal,
}

impl ErrorKind {
    /// Whether the resilient connection should retry this failure
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Transient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error raised by a primary-store driver or session
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} store error{}: {message}", .code.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct StoreError {
    pub kind: ErrorKind,
    /// Driver or server error code, when one was reported
    pub code: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KurultaiError {
    #[error("Primary store error: {0}")]
    Store(#[from] StoreError),
    #[error("Fallback store error during {operation}: {reason}")]
    FallbackStore { operation: String, reason: String },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl KurultaiError {
    pub fn fallback(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        KurultaiError::FallbackStore {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for KurultaiError {
    fn from(error: serde_json::Error) -> Self {
        KurultaiError::Serialization(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for KurultaiError {
    fn from(err: sqlx::Error) -> Self {
        KurultaiError::fallback("sqlite", err)
    }
}

impl From<ConfigurationError> for KurultaiError {
    fn from(err: ConfigurationError) -> Self {
        KurultaiError::Configuration(err.to_string())
    }
}

pub type KurultaiResult<T> = std::result::Result<T, KurultaiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Fatal.is_retryable());
    }

    #[test]
    fn test_store_error_display_includes_code() {
        let err = StoreError::transient("deadlock detected")
            .with_code("Neo.TransientError.Transaction.DeadlockDetected");
        let rendered = err.to_string();
        assert!(rendered.starts_with("transient store error"));
        assert!(rendered.contains("[Neo.TransientError.Transaction.DeadlockDetected]"));

        let bare = StoreError::fatal("bad credentials");
        assert_eq!(bare.to_string(), "fatal store error: bad credentials");
    }
}
