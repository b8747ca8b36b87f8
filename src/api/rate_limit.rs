//! Per-key token-bucket rate limiting.
//!
//! Capacity is `maxRequests`; the bucket refills linearly to full over
//! `windowMs`. Buckets idle for more than 10 minutes are evicted so the
//! map doesn't grow unbounded across many distinct keys.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

const BUCKET_IDLE_EVICTION: Duration = Duration::from_secs(600);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consumes one token for `key`, refilling first. Evicts buckets idle
    /// longer than 10 minutes while holding the lock.
    pub fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let capacity = self.config.max_requests as f64;
        let refill_per_ms = capacity / self.config.window_ms as f64;

        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        buckets.retain(|_, b| now.duration_since(b.last_touched) < BUCKET_IDLE_EVICTION);

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: now,
            last_touched: now,
        });

        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * refill_per_ms).min(capacity);
        bucket.last_refill = now;
        bucket.last_touched = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                retry_after_secs: 0,
            }
        } else {
            let deficit = 1.0 - bucket.tokens;
            let wait_ms = deficit / refill_per_ms;
            let retry_after_secs = (wait_ms / 1000.0).ceil().max(1.0) as u64;
            RateLimitDecision {
                allowed: false,
                retry_after_secs: retry_after_secs.min(self.config.window_ms / 1000),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_request_in_window_is_rate_limited() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window_ms: 60_000,
        });

        assert!(limiter.check("key-a").allowed);
        assert!(limiter.check("key-a").allowed);
        assert!(limiter.check("key-a").allowed);
        let fourth = limiter.check("key-a");
        assert!(!fourth.allowed);
        assert!(fourth.retry_after_secs >= 1 && fourth.retry_after_secs <= 60);
    }

    #[test]
    fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window_ms: 60_000,
        });
        assert!(limiter.check("key-a").allowed);
        assert!(limiter.check("key-b").allowed);
    }
}
