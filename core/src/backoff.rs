//! Exponential backoff with bounded symmetric jitter

use crate::retry::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponents past this point already saturate any sane `max` delay
const MAX_EXPONENT: i32 = 31;

/// Stateless delay calculator for retry attempts
///
/// `base = min(initial * 2^(attempt-1), max)`, then the delay is
/// `base * (1 + jitter * u)` with `u` uniform in `[-1, 1]`, clamped to `[0, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    /// Jitter is clamped to `[0, 1]`
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            initial,
            max,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.max_backoff,
            config.jitter_fraction,
        )
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Un-jittered delay before retry number `attempt` (1 = first retry)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.max(1) - 1).min(MAX_EXPONENT as u32) as i32;
        let base = self.initial.as_secs_f64() * 2f64.powi(exponent);
        if base >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(base)
    }

    /// Jittered delay before retry number `attempt`, drawn from the thread-local RNG
    pub fn next_delay(&self, attempt: u32) -> Duration {
        if self.jitter == 0.0 {
            return self.base_delay(attempt);
        }
        let u = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with_sample(attempt, u)
    }

    /// Jittered delay for a given uniform sample `u` (clamped to `[-1, 1]`)
    pub fn delay_with_sample(&self, attempt: u32, u: f64) -> Duration {
        let u = if u.is_nan() { 0.0 } else { u.clamp(-1.0, 1.0) };
        let base = self.base_delay(attempt).as_secs_f64();
        let jittered = base * (1.0 + self.jitter * u);
        if jittered >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(jitter: f64) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(5), jitter)
    }

    #[test]
    fn test_base_delay_doubles() {
        let p = policy(0.0);

        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_base_delay_capped_at_max() {
        let p = policy(0.0);

        assert_eq!(p.base_delay(7), Duration::from_secs(5));
        assert_eq!(p.base_delay(1_000), Duration::from_secs(5));
        assert_eq!(p.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_attempt_zero_treated_as_first_retry() {
        assert_eq!(policy(0.0).base_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_fourth_attempt_jitter_window() {
        // 100ms * 2^3 = 800ms, jitter 0.2 => [640ms, 960ms]
        let p = policy(0.2);

        for _ in 0..200 {
            let delay = p.next_delay(4);
            assert!(delay >= Duration::from_millis(640), "{:?} too short", delay);
            assert!(delay <= Duration::from_millis(960), "{:?} too long", delay);
        }
    }

    #[test]
    fn test_sample_extremes() {
        let p = policy(0.5);

        assert_eq!(p.delay_with_sample(2, -1.0), Duration::from_millis(100));
        assert_eq!(p.delay_with_sample(2, 0.0), Duration::from_millis(200));
        assert_eq!(p.delay_with_sample(2, 1.0), Duration::from_millis(300));
        // Out-of-range samples are clamped
        assert_eq!(p.delay_with_sample(2, 7.0), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_never_pushes_past_max() {
        let p = policy(1.0);
        assert_eq!(p.delay_with_sample(10, 1.0), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_jitter_is_constant() {
        let p = policy(0.0);
        let mut values = std::collections::HashSet::new();

        for _ in 0..10 {
            values.insert(p.next_delay(3));
        }

        assert_eq!(values.len(), 1, "Zero jitter should produce constant delay");
        assert!(values.contains(&Duration::from_millis(400)));
    }

    #[test]
    fn test_jitter_produces_variance() {
        let p = policy(0.5);
        let mut values = std::collections::HashSet::new();

        for _ in 0..20 {
            values.insert(p.next_delay(3));
        }

        assert!(
            values.len() >= 2,
            "Jitter should produce variance, got {} unique values",
            values.len()
        );
    }

    #[test]
    fn test_jitter_fraction_is_clamped() {
        assert_eq!(policy(3.0).jitter(), 1.0);
        assert_eq!(policy(-0.5).jitter(), 0.0);
        assert_eq!(policy(f64::NAN).jitter(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_delay_within_bounds(
            attempt in 1u32..64,
            initial_ms in 1u64..2_000,
            max_ms in 1u64..60_000,
            jitter in 0.0f64..=1.0,
            u in -1.0f64..=1.0,
        ) {
            let p = BackoffPolicy::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
                jitter,
            );
            let base = p.base_delay(attempt);
            let delay = p.delay_with_sample(attempt, u);

            prop_assert!(base <= p.max());
            prop_assert!(delay <= p.max());
            prop_assert!(delay.as_secs_f64() >= base.as_secs_f64() * (1.0 - jitter) - 1e-6);
        }

        #[test]
        fn prop_base_delay_non_decreasing(attempt in 1u32..63, jitter in 0.0f64..=1.0) {
            let p = policy(jitter);
            prop_assert!(p.base_delay(attempt) <= p.base_delay(attempt + 1));
        }
    }
}
