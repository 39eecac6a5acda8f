mod common;

use common::strategies::*;
use kurultai_core::config::FailoverConfig;
use kurultai_core::failover::{MessageRouter, RouteTarget};
use kurultai_core::fallback::FallbackTable;
use kurultai_core::resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Rejection, RetryPolicy,
};
use kurultai_core::store::Params;
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

fn breaker(failure_threshold: u32, daily_cost_limit: Option<f64>) -> CircuitBreaker {
    CircuitBreaker::new(
        "property",
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(3_600),
            half_open_max_calls: 1,
            daily_cost_limit,
        },
    )
}

proptest! {
    /// Property: within one recovery window the circuit opens exactly when
    /// `threshold` consecutive failures were seen, and never closes on its own
    #[test]
    fn circuit_opens_once_threshold_reached(
        threshold in 1u32..8,
        calls in call_sequence_strategy(),
    ) {
        let breaker = breaker(threshold, None);
        let mut consecutive = 0u32;
        let mut opened = false;

        for call in calls {
            match call {
                CallOutcome::Success => breaker.record_success(0.0),
                CallOutcome::Failure => breaker.record_failure(),
            }
            if !opened {
                match call {
                    CallOutcome::Success => consecutive = 0,
                    CallOutcome::Failure => consecutive += 1,
                }
                opened = consecutive >= threshold;
            }

            let expected = if opened { CircuitState::Open } else { CircuitState::Closed };
            prop_assert_eq!(breaker.state(), expected);
            prop_assert_eq!(breaker.can_execute(), !opened);
        }
        prop_assert_eq!(breaker.metrics().times_opened, u64::from(opened));
    }

    /// Property: the daily cost limit is a hard stop that `reset` does not lift
    #[test]
    fn cost_limit_survives_reset(limit in 0.5f64..20.0, costs in cost_sequence_strategy()) {
        let breaker = breaker(5, Some(limit));
        let mut spent = 0.0f64;

        for cost in costs {
            if !breaker.can_execute() {
                break;
            }
            breaker.record_success(cost);
            if cost > 0.0 {
                spent += cost;
            }
        }
        prop_assert_eq!(breaker.daily_cost(), spent);

        breaker.reset();
        let refused = matches!(breaker.check(), Err(Rejection::CostLimitReached { .. }));
        prop_assert_eq!(refused, spent >= limit);
        prop_assert_eq!(breaker.metrics().cost_limit_reached(), spent >= limit);
    }

    /// Property: jittered delays stay within [delay / 2, delay] and never exceed the cap
    #[test]
    fn backoff_delay_is_bounded(
        base_ms in 1u64..2_000,
        max_ms in 1u64..60_000,
        attempt in 0u32..40,
    ) {
        let exact = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            exponential_base: 2.0,
            jitter: false,
        };
        let jittered = RetryPolicy { jitter: true, ..exact.clone() };

        // float conversions may round by a nanosecond
        let slack = Duration::from_micros(1);

        let capped = exact.delay_for_attempt(attempt);
        prop_assert!(capped <= exact.max_delay + slack);
        prop_assert!(exact.delay_for_attempt(attempt + 1) + slack >= capped);

        let delay = jittered.delay_for_attempt(attempt);
        prop_assert!(delay <= capped + slack);
        prop_assert!(delay + slack >= capped / 2);
    }

    /// Property: merged agent state keeps the newest heartbeat whatever the arrival order
    #[test]
    fn merged_heartbeat_is_the_maximum(beats in heartbeat_sequence_strategy()) {
        let mut state = Params::new();
        for beat in &beats {
            let mut incoming = Params::new();
            incoming.insert("last_heartbeat".to_string(), json!(beat));
            FallbackTable::AgentState.merge(&mut state, &incoming);
        }
        let newest = beats.iter().copied().max();
        prop_assert_eq!(state["last_heartbeat"].as_i64(), newest);
    }

    /// Property: critical messages always reach a configured agent, case-insensitively
    #[test]
    fn critical_routes_target_known_agents(message in message_strategy()) {
        let config = FailoverConfig::default();
        let router = MessageRouter::new(&config.routes, config.standby_agent_id.clone());

        let target = router.route_critical(&message);
        let RouteTarget::Agent(agent) = &target else {
            return Err(TestCaseError::fail("critical message was queued"));
        };
        prop_assert!(config.known_agents.contains(agent));
        prop_assert_eq!(router.route_critical(&message.to_lowercase()), target.clone());
    }
}
