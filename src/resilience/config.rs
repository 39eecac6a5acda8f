//! # Resilience Configuration
//!
//! Runtime forms of the `retry` and `circuit_breaker` configuration sections,
//! with millisecond fields resolved to [`Duration`]s.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{CircuitBreakerSettings, RetrySettings};

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before probing recovery
    pub recovery_timeout: Duration,

    /// Consecutive successes the connection needs before it reports healthy again
    pub half_open_max_calls: u32,

    /// Hard daily spending cap, if any
    pub daily_cost_limit: Option<f64>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            recovery_timeout: Duration::from_millis(settings.recovery_timeout_ms),
            half_open_max_calls: settings.half_open_max_calls.max(1),
            daily_cost_limit: settings.daily_cost_limit,
        }
    }
}

/// Retry behavior for primary-store attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            exponential_base: settings.exponential_base,
            jitter: settings.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy with no waiting between attempts
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            exponential_base: 1.0,
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_settings() {
        let breaker = CircuitBreakerConfig::default();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(60));
        assert_eq!(breaker.half_open_max_calls, 3);
        assert!(breaker.daily_cost_limit.is_none());

        let retry = RetryPolicy::default();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        assert!(retry.jitter);
    }
}
