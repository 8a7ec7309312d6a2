//! Token-bucket rate limiting
//!
//! Each limiter keeps per-key buckets in a concurrent map, refilled
//! lazily on access, so a check is O(1) and touches only its own key's
//! entry. Idle buckets are evicted by a periodic sweep.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long an untouched bucket survives before the sweep drops it
pub const BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

/// Sweep cadence
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A single keyed token-bucket table.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    enabled: bool,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            max_tokens: f64::from(max_tokens),
            refill_rate,
            enabled: true,
            buckets: DashMap::new(),
        }
    }

    /// A limiter that always allows and keeps no state.
    pub fn disabled(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            enabled: false,
            ..Self::new(max_tokens, refill_rate)
        }
    }

    /// Check and consume one token for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_cost(key, 1.0)
    }

    /// Check and consume `cost` tokens for `key`. Refills first, then
    /// deducts when the bucket covers the cost.
    pub fn allow_cost(&self, key: &str, cost: f64) -> bool {
        if !self.enabled {
            return true;
        }

        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Drop the bucket for `key`, restoring the full budget on next use.
    pub fn reset(&self, key: &str) {
        if !self.enabled {
            return;
        }
        self.buckets.remove(key);
    }

    /// Evict buckets untouched for longer than `ttl`.
    pub fn sweep(&self, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < ttl);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// The three bucket tables the server runs with.
#[derive(Debug)]
pub struct RateLimits {
    /// Keyed by peer address: control-plane connection attempts
    pub connections: RateLimiter,
    /// Keyed by session id: tunnel creations
    pub tunnels: RateLimiter,
    /// Keyed by tunnel id: proxied requests
    pub requests: RateLimiter,
}

pub mod defaults {
    pub const CONNECTIONS_MAX: u32 = 10;
    pub const CONNECTIONS_RATE: f64 = 1.0;
    pub const TUNNELS_MAX: u32 = 5;
    pub const TUNNELS_RATE: f64 = 0.1;
    pub const REQUESTS_MAX: u32 = 100;
    pub const REQUESTS_RATE: f64 = 50.0;
}

impl RateLimits {
    pub fn new(enabled: bool) -> Self {
        let build = if enabled {
            RateLimiter::new
        } else {
            RateLimiter::disabled
        };
        Self {
            connections: build(defaults::CONNECTIONS_MAX, defaults::CONNECTIONS_RATE),
            tunnels: build(defaults::TUNNELS_MAX, defaults::TUNNELS_RATE),
            requests: build(defaults::REQUESTS_MAX, defaults::REQUESTS_RATE),
        }
    }

    /// Periodic eviction of idle buckets across all three tables.
    pub fn spawn_sweeper(limits: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_PERIOD);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                limits.connections.sweep(BUCKET_TTL);
                limits.tunnels.sweep(BUCKET_TTL);
                limits.requests.sweep(BUCKET_TTL);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_bounded_by_capacity() {
        // Zero refill: exactly max_tokens calls may pass.
        let limiter = RateLimiter::new(5, 0.0);
        let allowed = (0..10).filter(|_| limiter.allow("k")).count();
        assert_eq!(allowed, 5);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, 0.0);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_refill_grants_more_tokens() {
        let limiter = RateLimiter::new(1, 100.0);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        std::thread::sleep(Duration::from_millis(50));
        // 100 tokens/s for 50ms is well past one token, capped at max
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_refill_caps_at_max() {
        let limiter = RateLimiter::new(2, 1000.0);
        assert!(limiter.allow("k"));
        std::thread::sleep(Duration::from_millis(20));
        // Refill cannot exceed capacity no matter how long we wait
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_cost_deducts_in_bulk() {
        let limiter = RateLimiter::new(10, 0.0);
        assert!(limiter.allow_cost("k", 8.0));
        assert!(!limiter.allow_cost("k", 3.0));
        assert!(limiter.allow_cost("k", 2.0));
    }

    #[test]
    fn test_reset_restores_budget() {
        let limiter = RateLimiter::new(1, 0.0);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        limiter.reset("k");
        assert!(limiter.allow("k"));
    }

    #[test]
    fn test_sweep_evicts_idle_buckets() {
        let limiter = RateLimiter::new(1, 0.0);
        limiter.allow("stale");
        assert_eq!(limiter.bucket_count(), 1);
        limiter.sweep(Duration::from_secs(0));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_disabled_limiter_always_allows() {
        let limiter = RateLimiter::disabled(1, 0.0);
        for _ in 0..100 {
            assert!(limiter.allow("k"));
        }
        assert_eq!(limiter.bucket_count(), 0);
    }
}
