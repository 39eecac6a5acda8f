//! # Resilience Module
//!
//! Fault-tolerance building blocks used by the resilient connection.
//!
//! ## Architecture
//!
//! - **Circuit Breaker**: failure-count and daily-cost gate in front of the primary store
//! - **Retry Policy**: bounded exponential backoff with jitter
//! - **Error Classification**: maps driver signals onto retry/fallback decisions
//! - **Metrics**: serializable breaker snapshots for status reporting
//!
//! ## Usage
//!
//! ```rust
//! use kurultai_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     "primary_store",
//!     CircuitBreakerConfig {
//!         failure_threshold: 2,
//!         recovery_timeout: Duration::from_secs(30),
//!         half_open_max_calls: 1,
//!         daily_cost_limit: None,
//!     },
//! );
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert!(!breaker.can_execute());
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod error_classifier;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitState, Rejection};
pub use config::{CircuitBreakerConfig, RetryPolicy};
pub use error_classifier::{
    ErrorCategory, ErrorClassification, ErrorClassifier, StandardErrorClassifier,
};
pub use metrics::CircuitBreakerMetrics;
