// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Token-bucket rate limiting, evaluated per client identifier before a
//! workflow is submitted. A rejection never partially executes a workflow;
//! it carries a retry-after hint for the client.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Header names used when surfacing limiter decisions over a transport.
pub mod headers {
    pub const LIMIT: &str = "X-RateLimit-Limit";
    pub const WINDOW: &str = "X-RateLimit-Window";
    pub const REMAINING: &str = "X-RateLimit-Remaining";
    pub const RETRY_AFTER: &str = "Retry-After";
}

/// Limiter configuration: `requests` allowed per `window`.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a limiter check.
#[derive(Clone, Debug, PartialEq)]
pub enum RateLimitDecision {
    /// Allowed; `remaining` whole requests left in the bucket.
    Allowed { remaining: u32 },
    /// Rejected; retry after the given duration.
    Rejected { retry_after: Duration },
}

impl RateLimitDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per client identifier (IP or API key).
///
/// The bucket holds `requests` tokens and refills continuously at
/// `requests / window`. Each allowed request consumes one token; burst
/// capacity equals the full window allowance.
pub struct TokenBucketRateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl TokenBucketRateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Tokens per second of refill.
    fn rate(&self) -> f64 {
        f64::from(self.config.requests) / self.config.window.as_secs_f64().max(f64::EPSILON)
    }

    /// Check (and consume from) the bucket for `client_id`.
    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::Allowed {
                remaining: self.config.requests,
            };
        }

        let now = Instant::now();
        let capacity = f64::from(self.config.requests);
        let mut bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate()).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision::Allowed {
                remaining: bucket.tokens.floor() as u32,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after = Duration::from_secs_f64(deficit / self.rate());
            RateLimitDecision::Rejected {
                // Clients round down; never hint zero.
                retry_after: retry_after.max(Duration::from_secs(1)),
            }
        }
    }

    /// The configured limit, for response headers.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.config.requests
    }

    /// The configured window, for response headers.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.config.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: u32, window_s: u64) -> TokenBucketRateLimiter {
        TokenBucketRateLimiter::new(RateLimitConfig {
            enabled: true,
            requests,
            window: Duration::from_secs(window_s),
        })
    }

    #[test]
    fn allows_up_to_limit_then_rejects_with_retry_after() {
        let limiter = limiter(3, 60);
        assert!(limiter.check("client").is_allowed());
        assert!(limiter.check("client").is_allowed());
        assert!(limiter.check("client").is_allowed());

        match limiter.check("client") {
            RateLimitDecision::Rejected { retry_after } => {
                assert!(retry_after >= Duration::from_secs(1));
                assert!(retry_after <= Duration::from_secs(21));
            }
            RateLimitDecision::Allowed { .. } => panic!("fourth request must be rejected"),
        }
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = limiter(3, 60);
        assert_eq!(
            limiter.check("c"),
            RateLimitDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            limiter.check("c"),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check("c"),
            RateLimitDecision::Allowed { remaining: 0 }
        );
    }

    #[test]
    fn clients_have_independent_buckets() {
        let limiter = limiter(1, 60);
        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());
        assert!(limiter.check("b").is_allowed());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig {
            enabled: false,
            requests: 1,
            window: Duration::from_secs(60),
        });
        for _ in 0..10 {
            assert!(limiter.check("c").is_allowed());
        }
    }

    #[test]
    fn header_names_are_stable() {
        assert_eq!(headers::LIMIT, "X-RateLimit-Limit");
        assert_eq!(headers::WINDOW, "X-RateLimit-Window");
        assert_eq!(headers::REMAINING, "X-RateLimit-Remaining");
        assert_eq!(headers::RETRY_AFTER, "Retry-After");
    }

    #[test]
    fn bucket_refills_over_time() {
        // 100 requests / 1s window -> refill is 10ms per token.
        let limiter = limiter(100, 1);
        for _ in 0..100 {
            assert!(limiter.check("c").is_allowed());
        }
        assert!(!limiter.check("c").is_allowed());
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.check("c").is_allowed());
    }
}
