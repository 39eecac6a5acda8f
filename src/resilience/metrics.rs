//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshot of a circuit breaker, serializable for status reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,

    pub current_state: CircuitState,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    pub failure_threshold: u32,

    /// Total number of calls whose outcome was recorded
    pub total_calls: u64,

    pub success_count: u64,

    pub failure_count: u64,

    /// Calls refused by an open circuit or the cost limit
    pub rejected_calls: u64,

    /// Closed/Half-Open -> Open transitions
    pub times_opened: u64,

    pub daily_cost: f64,

    pub daily_cost_limit: Option<f64>,

    pub last_failure_time: Option<DateTime<Utc>>,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Calculated success rate (0.0 to 1.0)
    pub success_rate: f64,
}

impl CircuitBreakerMetrics {
    /// Check if metrics indicate healthy operation
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => !self.cost_limit_reached(),
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn cost_limit_reached(&self) -> bool {
        self.daily_cost_limit
            .is_some_and(|limit| self.daily_cost >= limit)
    }

    /// Remaining spend for today, if a limit is configured
    pub fn remaining_budget(&self) -> Option<f64> {
        self.daily_cost_limit
            .map(|limit| (limit - self.daily_cost).max(0.0))
    }
}
