// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Exponential backoff with jitter, shared by the workflow runtime and the
//! LLM invocation layer.

use crate::error::Error;
use rand::Rng;
use std::time::Duration;

/// Retry configuration for retryable failures.
///
/// Delay for attempt `n` (0-indexed) is
/// `min(initial_backoff * multiplier^n, max_backoff)`, widened by up to
/// `jitter` fraction in either direction. An upstream retry-after hint
/// overrides the computed delay when it is larger.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of re-executions after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling on any single delay.
    pub max_backoff: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; 0.1 widens delays by +/-10%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Compute the delay before retry attempt `attempt` (0-indexed) for the
    /// given failure. Returns `None` when the budget is exhausted or the
    /// error is not retryable.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if attempt >= self.max_retries || !error.is_retryable() {
            return None;
        }

        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        let mut delay = Duration::from_secs_f64(jittered);

        // A rate-limit hint from upstream is authoritative when longer.
        if let Some(hint) = error.retry_after() {
            if hint > delay {
                delay = hint.min(self.max_backoff);
            }
        }

        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_budget_returns_none() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let err = Error::transient("blip");
        assert!(policy.delay_for(0, &err).is_some());
        assert!(policy.delay_for(1, &err).is_some());
        assert!(policy.delay_for(2, &err).is_none());
    }

    #[test]
    fn non_retryable_returns_none() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(0, &Error::non_retryable("refused")).is_none());
        assert!(policy.delay_for(0, &Error::invalid_input("bad")).is_none());
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let err = Error::transient("blip");
        let d0 = policy.delay_for(0, &err).unwrap();
        let d1 = policy.delay_for(1, &err).unwrap();
        let d2 = policy.delay_for(2, &err).unwrap();
        assert_eq!(d0, Duration::from_millis(100));
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(400));
    }

    #[test]
    fn delay_capped_at_max_backoff() {
        let policy = RetryPolicy {
            max_retries: 20,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            multiplier: 10.0,
            jitter: 0.0,
        };
        let err = Error::transient("blip");
        assert_eq!(policy.delay_for(10, &err).unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn retry_after_hint_overrides_shorter_computed_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let err = Error::rate_limited("429", Some(Duration::from_secs(3)));
        assert_eq!(policy.delay_for(0, &err).unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = RetryPolicy {
            max_retries: 1,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
        };
        let err = Error::transient("blip");
        for _ in 0..100 {
            let d = policy.delay_for(0, &err).unwrap();
            assert!(d >= Duration::from_millis(900), "delay {d:?} below jitter floor");
            assert!(d <= Duration::from_millis(1100), "delay {d:?} above jitter ceiling");
        }
    }
}
