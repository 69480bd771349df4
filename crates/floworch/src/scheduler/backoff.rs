// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Exponential retry backoff with jitter.

use crate::definition::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Delay before the given retry attempt (1-based), with the policy's
/// jitter fraction randomized away symmetrically.
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = policy.base_delay_ms as f64 * policy.factor.powi(exponent as i32);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((base * factor).max(0.0) as u64)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_delays_grow_exponentially_without_jitter() {
        let policy = policy(0.0);
        assert_eq!(delay_for(&policy, 1), Duration::from_millis(100));
        assert_eq!(delay_for(&policy, 2), Duration::from_millis(200));
        assert_eq!(delay_for(&policy, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy(0.2);
        for _ in 0..100 {
            let delay = delay_for(&policy, 2).as_millis() as f64;
            assert!((160.0..=240.0).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_exponent_is_capped() {
        let policy = policy(0.0);
        // Attempt numbers far beyond the cap must not overflow.
        let huge = delay_for(&policy, 10_000);
        assert_eq!(huge, delay_for(&policy, 17));
    }
}
