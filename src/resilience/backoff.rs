//! Exponential backoff with optional jitter.
//!
//! `delay(attempt) = min(base_delay * exponential_base^attempt, max_delay)`, then
//! multiplied by a uniform factor in `[0.5, 1.0]` when jitter is enabled.

use rand::Rng;
use std::time::Duration;

use super::RetryPolicy;

impl RetryPolicy {
    /// Delay to wait after the zero-based `attempt` failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let factor = rand::rng().random_range(0.5..=1.0);
        capped.mul_f64(factor)
    }

    fn capped_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.exponential_base.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let raw_secs = self.base_delay.as_secs_f64() * multiplier;
        if !raw_secs.is_finite() || raw_secs >= max_secs {
            self.max_delay
        } else {
            Duration::from_secs_f64(raw_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            exponential_base: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = policy(false);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_stays_within_half_to_full() {
        let policy = policy(true);
        for attempt in 0..6 {
            let ceiling = policy.capped_delay(attempt);
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling.mul_f64(0.5));
            }
        }
    }

    #[test]
    fn test_immediate_policy_never_waits() {
        let policy = RetryPolicy::immediate(4);
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
    }
}
