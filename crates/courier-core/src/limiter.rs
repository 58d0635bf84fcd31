//! Per-client token-bucket admission control.
//!
//! Each client gets a bucket with `capacity = max_concurrent_tasks` tokens
//! refilled at `max_tasks_per_minute / 60` tokens per second. One token is
//! consumed per admitted command. Buckets idle for ten minutes are evicted
//! on a five-minute sweep so the map stays bounded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission limits, typically sourced from the environment.
#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    /// Steady-state rate: tokens refilled per minute.
    pub max_tasks_per_minute: u32,
    /// Burst capacity: maximum tokens in a bucket.
    pub max_concurrent_tasks: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_minute: 10,
            max_concurrent_tasks: 5,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    /// The configured per-minute limit, for the `RateLimit-Limit` header.
    pub limit: u32,
    /// Whole tokens left in the bucket, for `RateLimit-Remaining`.
    pub remaining: u32,
    /// Seconds until the next token when rejected; 0 when allowed.
    pub retry_after: f64,
}

struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Refill by elapsed time, then try to consume one token.
    fn consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after(&self) -> f64 {
        if self.tokens >= 1.0 {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_rate
        }
    }
}

/// Process-global admission limiter.
pub struct RateLimiter {
    config: LimiterConfig,
    sweep_interval: Duration,
    idle_ttl: Duration,
    buckets: Mutex<Buckets>,
}

struct Buckets {
    map: HashMap<String, TokenBucket>,
    last_sweep: Instant,
}

impl RateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_timing(
            config,
            Duration::from_secs(300),
            Duration::from_secs(600),
        )
    }

    /// Construct with explicit sweep timing (tests).
    pub fn with_timing(config: LimiterConfig, sweep_interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            config,
            sweep_interval,
            idle_ttl,
            buckets: Mutex::new(Buckets {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> LimiterConfig {
        self.config
    }

    /// Check whether a command from `client` is admitted, consuming one
    /// token when it is.
    pub fn check(&self, client: &str) -> Decision {
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");

        let now = Instant::now();
        if now.duration_since(buckets.last_sweep) > self.sweep_interval {
            let idle_ttl = self.idle_ttl;
            let before = buckets.map.len();
            buckets
                .map
                .retain(|_, b| now.duration_since(b.last_refill) <= idle_ttl);
            let evicted = before - buckets.map.len();
            if evicted > 0 {
                tracing::debug!(evicted, "evicted stale rate limit buckets");
            }
            buckets.last_sweep = now;
        }

        let capacity = f64::from(self.config.max_concurrent_tasks);
        let refill_rate = f64::from(self.config.max_tasks_per_minute) / 60.0;
        let bucket = buckets
            .map
            .entry(client.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, refill_rate));

        if bucket.consume() {
            Decision {
                allowed: true,
                limit: self.config.max_tasks_per_minute,
                remaining: bucket.tokens.floor() as u32,
                retry_after: 0.0,
            }
        } else {
            let retry_after = bucket.retry_after();
            tracing::warn!(
                client = %client,
                retry_after = format!("{retry_after:.1}"),
                "rate limited"
            );
            Decision {
                allowed: false,
                limit: self.config.max_tasks_per_minute,
                remaining: 0,
                retry_after,
            }
        }
    }

    /// Number of live buckets (tests / observability).
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("limiter lock poisoned").map.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(LimiterConfig {
            max_tasks_per_minute: per_minute,
            max_concurrent_tasks: burst,
        })
    }

    #[test]
    fn admits_up_to_burst_capacity() {
        let l = limiter(60, 2);
        assert!(l.check("1.2.3.4").allowed);
        assert!(l.check("1.2.3.4").allowed);
        let third = l.check("1.2.3.4");
        assert!(!third.allowed);
    }

    #[test]
    fn rejection_reports_retry_after_about_one_token() {
        let l = limiter(60, 2);
        l.check("c");
        l.check("c");
        let rejected = l.check("c");
        assert!(!rejected.allowed);
        // 60/min = 1 token per second; the bucket is near-empty.
        assert!(
            (rejected.retry_after - 1.0).abs() < 0.1,
            "retry_after was {}",
            rejected.retry_after
        );
    }

    #[test]
    fn remaining_counts_down() {
        let l = limiter(60, 2);
        let first = l.check("c");
        assert_eq!(first.remaining, 1);
        let second = l.check("c");
        assert_eq!(second.remaining, 0);
    }

    #[test]
    fn clients_have_independent_buckets() {
        let l = limiter(60, 1);
        assert!(l.check("a").allowed);
        assert!(!l.check("a").allowed);
        assert!(l.check("b").allowed, "a's exhaustion must not affect b");
    }

    #[test]
    fn tokens_refill_over_time() {
        // 6000/min = 100 tokens per second.
        let l = limiter(6000, 1);
        assert!(l.check("c").allowed);
        assert!(!l.check("c").allowed);
        std::thread::sleep(Duration::from_millis(50));
        assert!(l.check("c").allowed, "bucket should refill within 50ms at 100/s");
    }

    #[test]
    fn limit_header_value_matches_config() {
        let l = limiter(42, 3);
        assert_eq!(l.check("c").limit, 42);
    }

    #[test]
    fn stale_buckets_are_swept() {
        let l = RateLimiter::with_timing(
            LimiterConfig {
                max_tasks_per_minute: 60,
                max_concurrent_tasks: 2,
            },
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        l.check("old");
        assert_eq!(l.bucket_count(), 1);

        std::thread::sleep(Duration::from_millis(40));
        // The next check triggers the sweep; "old" has been idle > ttl.
        l.check("fresh");
        assert_eq!(l.bucket_count(), 1, "only the fresh bucket should survive");
    }
}
