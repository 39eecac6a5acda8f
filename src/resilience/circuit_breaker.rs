//! # Circuit Breaker Implementation
//!
//! Gate in front of the primary store with three states: Closed (normal
//! operation), Open (bypass to fallback) and Half-Open (next call probes
//! recovery). The Open -> Half-Open transition is evaluated lazily whenever the
//! state is queried; there is no background timer.
//!
//! A daily cost budget is tracked alongside the failure count. Once the day's
//! cost reaches the limit, [`CircuitBreaker::can_execute`] refuses every call
//! regardless of circuit state until the calendar day (UTC) rolls over.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{CircuitBreakerConfig, CircuitBreakerMetrics};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - calls skip the primary store
    Open,
    /// Testing recovery - the next call probes the primary store
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Why [`CircuitBreaker::can_execute`] refused a call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Rejection {
    CircuitOpen,
    CostLimitReached { daily_cost: f64, limit: f64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::CircuitOpen => write!(f, "circuit open"),
            Rejection::CostLimitReached { daily_cost, limit } => {
                write!(f, "daily cost limit reached ({daily_cost:.2} >= {limit:.2})")
            }
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    daily_cost: f64,
    cost_reset_day: NaiveDate,
    total_calls: u64,
    success_count: u64,
    failure_count: u64,
    rejected_calls: u64,
    times_opened: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_time: None,
            daily_cost: 0.0,
            cost_reset_day: Utc::now().date_naive(),
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_calls: 0,
            times_opened: 0,
        }
    }
}

/// Failure-count and cost gate protecting one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            daily_cost_limit = config.daily_cost_limit,
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy Open -> Half-Open transition
    pub fn state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether the primary store may be attempted right now
    pub fn can_execute(&self) -> bool {
        self.check().is_ok()
    }

    /// Like [`can_execute`](Self::can_execute) but reports why a call was refused
    pub fn check(&self) -> Result<(), Rejection> {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);

        if let Some(limit) = self.config.daily_cost_limit {
            if inner.daily_cost >= limit {
                inner.rejected_calls += 1;
                return Err(Rejection::CostLimitReached {
                    daily_cost: inner.daily_cost,
                    limit,
                });
            }
        }

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                inner.rejected_calls += 1;
                Err(Rejection::CircuitOpen)
            }
        }
    }

    /// Record a successful primary-store call and its cost
    pub fn record_success(&self, cost: f64) {
        let mut inner = self.state.lock();
        self.roll_cost_day(&mut inner);
        inner.total_calls += 1;
        inner.success_count += 1;
        if cost.is_finite() && cost > 0.0 {
            inner.daily_cost += cost;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.last_failure = None;
                info!(
                    component = %self.name,
                    total_calls = inner.total_calls,
                    "Circuit breaker closed (recovered)"
                );
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late
                debug!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    /// Record a failed primary-store call
    pub fn record_failure(&self) {
        let mut inner = self.state.lock();
        inner.total_calls += 1;
        inner.failure_count += 1;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                warn!(component = %self.name, "Recovery probe failed");
                self.open(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Clear failure tracking and close the circuit. The daily cost is untouched.
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        info!(component = %self.name, "Circuit breaker reset");
    }

    /// Force circuit to open state (operator action)
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        let mut inner = self.state.lock();
        inner.last_failure = Some(Instant::now());
        inner.last_failure_time = Some(Utc::now());
        self.open(&mut inner);
    }

    /// Force circuit to closed state (operator action)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.reset();
    }

    pub fn daily_cost(&self) -> f64 {
        let mut inner = self.state.lock();
        self.roll_cost_day(&mut inner);
        inner.daily_cost
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut inner = self.state.lock();
        self.refresh(&mut inner);

        let (failure_rate, success_rate) = if inner.total_calls > 0 {
            (
                inner.failure_count as f64 / inner.total_calls as f64,
                inner.success_count as f64 / inner.total_calls as f64,
            )
        } else {
            (0.0, 0.0)
        };

        CircuitBreakerMetrics {
            name: self.name.clone(),
            current_state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            total_calls: inner.total_calls,
            success_count: inner.success_count,
            failure_count: inner.failure_count,
            rejected_calls: inner.rejected_calls,
            times_opened: inner.times_opened,
            daily_cost: inner.daily_cost,
            daily_cost_limit: self.config.daily_cost_limit,
            last_failure_time: inner.last_failure_time,
            failure_rate,
            success_rate,
        }
    }

    fn refresh(&self, inner: &mut BreakerState) {
        self.roll_cost_day(inner);
        if inner.state == CircuitState::Open {
            let recovered = match inner.last_failure {
                Some(at) => at.elapsed() >= self.config.recovery_timeout,
                None => true,
            };
            if recovered {
                inner.state = CircuitState::HalfOpen;
                info!(component = %self.name, "Circuit breaker half-open (testing recovery)");
            }
        }
    }

    fn roll_cost_day(&self, inner: &mut BreakerState) {
        let today = Utc::now().date_naive();
        if today != inner.cost_reset_day {
            if inner.daily_cost > 0.0 {
                info!(
                    component = %self.name,
                    previous_cost = inner.daily_cost,
                    "Daily cost budget reset"
                );
            }
            inner.daily_cost = 0.0;
            inner.cost_reset_day = today;
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            inner.times_opened += 1;
        }
        inner.state = CircuitState::Open;
        error!(
            component = %self.name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
            "Circuit breaker opened (bypassing primary store)"
        );
    }

    #[cfg(test)]
    pub(crate) fn backdate_cost_day(&self, days: i64) {
        let mut inner = self.state.lock();
        inner.cost_reset_day -= chrono::Duration::days(days);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn config(failure_threshold: u32, recovery_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_millis(recovery_ms),
            half_open_max_calls: 1,
            daily_cost_limit: None,
        }
    }

    #[test]
    fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test", config(3, 100));
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.can_execute());

        circuit.record_success(0.0);
        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[test]
    fn test_circuit_breaker_opens_on_failures() {
        let circuit = CircuitBreaker::new("test", config(2, 60_000));

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.can_execute());

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.can_execute());
        assert_eq!(circuit.check(), Err(Rejection::CircuitOpen));
        assert_eq!(circuit.metrics().times_opened, 1);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new("test", config(3, 60_000));
        circuit.record_failure();
        circuit.record_failure();
        circuit.record_success(0.0);
        circuit.record_failure();
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovery() {
        let circuit = CircuitBreaker::new("test", config(1, 50));

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        assert!(circuit.can_execute());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.record_success(0.0);
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test", config(1, 30));
        circuit.record_failure();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.can_execute());
    }

    #[test]
    fn test_force_operations() {
        let circuit = CircuitBreaker::new("test", config(1, 60_000));

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn test_daily_cost_is_a_hard_stop_independent_of_reset() {
        let mut cfg = config(5, 60_000);
        cfg.daily_cost_limit = Some(1.0);
        let circuit = CircuitBreaker::new("test", cfg);

        circuit.record_success(0.6);
        assert!(circuit.can_execute());
        circuit.record_success(0.6);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(!circuit.can_execute());
        assert!(matches!(
            circuit.check(),
            Err(Rejection::CostLimitReached { .. })
        ));

        circuit.reset();
        assert!(!circuit.can_execute());

        circuit.backdate_cost_day(1);
        assert!(circuit.can_execute());
        assert_eq!(circuit.daily_cost(), 0.0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_open_exactly_once() {
        let circuit = Arc::new(CircuitBreaker::new("test", config(5, 60_000)));
        let handles: Vec<_> = (0..20)
            .map(|_| {
                let circuit = Arc::clone(&circuit);
                tokio::spawn(async move { circuit.record_failure() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(!circuit.can_execute());
        let metrics = circuit.metrics();
        assert_eq!(metrics.failure_count, 20);
        assert_eq!(metrics.times_opened, 1);
    }
}
