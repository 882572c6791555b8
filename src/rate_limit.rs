//! Per-client token-bucket rate limiting.
//!
//! Buckets are keyed by the IP portion of the peer address, so one client
//! hitting the server from many ephemeral ports shares a single bucket.
//! Expired buckets are garbage-collected lazily from inside `check` rather
//! than by a dedicated thread.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often the bucket map is swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);
/// Buckets idle this long are dropped.
const BUCKET_EXPIRY: Duration = Duration::from_secs(3600);

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub active_clients: usize,
}

struct LimiterInner {
    buckets: HashMap<String, TokenBucket>,
    total_requests: u64,
    blocked_requests: u64,
    last_cleanup: Instant,
}

pub struct RateLimiter {
    enabled: bool,
    rate: f64,
    burst: f64,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64, enabled: bool) -> Self {
        if enabled {
            tracing::info!(rate, burst, "rate limiter enabled");
        }
        Self {
            enabled,
            rate,
            burst,
            inner: Mutex::new(LimiterInner {
                buckets: HashMap::new(),
                total_requests: 0,
                blocked_requests: 0,
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Disabled limiter that admits everything without touching state.
    pub fn disabled() -> Self {
        Self::new(100.0, 200.0, false)
    }

    /// Decide whether one request from `client` (an `ip:port` or bare `ip`
    /// string) is admitted.
    pub fn check(&self, client: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;

        let now = Instant::now();
        if now.duration_since(inner.last_cleanup) >= CLEANUP_INTERVAL {
            inner
                .buckets
                .retain(|_, bucket| now.duration_since(bucket.last_refill) < BUCKET_EXPIRY);
            inner.last_cleanup = now;
        }

        let ip = extract_ip(client).to_string();
        let burst = self.burst;
        let rate = self.rate;
        let bucket = inner
            .buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::full(burst));

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = burst.min(bucket.tokens + elapsed * rate);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            inner.blocked_requests += 1;
            false
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn stats(&self) -> RateLimiterStats {
        let inner = self.inner.lock().unwrap();
        RateLimiterStats {
            total_requests: inner.total_requests,
            blocked_requests: inner.blocked_requests,
            active_clients: inner.buckets.len(),
        }
    }

    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests = 0;
        inner.blocked_requests = 0;
    }
}

/// Everything before the last `:` — handles `ip:port` and bare `ip`.
fn extract_ip(address: &str) -> &str {
    match address.rfind(':') {
        Some(pos) => &address[..pos],
        None => address,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(1.0, 1.0, false);
        for _ in 0..100 {
            assert!(limiter.check("127.0.0.1"));
        }
        // Disabled checks must not mutate state.
        assert_eq!(limiter.stats(), RateLimiterStats::default());
    }

    #[test]
    fn burst_capacity_is_honored() {
        let limiter = RateLimiter::new(5.0, 10.0, true);
        for i in 0..10 {
            assert!(limiter.check("192.168.1.1"), "request {} should pass", i);
        }
        assert!(!limiter.check("192.168.1.1"));
    }

    #[test]
    fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(5.0, 10.0, true);
        for _ in 0..10 {
            limiter.check("192.168.1.2");
        }
        assert!(!limiter.check("192.168.1.2"));

        // 5 tokens/s means one token every 200ms.
        thread::sleep(Duration::from_millis(300));
        assert!(limiter.check("192.168.1.2"));
    }

    #[test]
    fn buckets_are_per_client() {
        let limiter = RateLimiter::new(5.0, 10.0, true);
        for _ in 0..10 {
            limiter.check("192.168.1.1");
        }
        assert!(!limiter.check("192.168.1.1"));
        assert!(limiter.check("192.168.1.2"));
    }

    #[test]
    fn same_ip_different_ports_share_a_bucket() {
        let limiter = RateLimiter::new(1.0, 1.0, true);
        assert!(limiter.check("192.168.1.100:8080"));
        assert!(!limiter.check("192.168.1.100:9090"));
        assert_eq!(limiter.stats().active_clients, 1);
    }

    #[test]
    fn stats_count_totals_and_blocks() {
        let limiter = RateLimiter::new(5.0, 10.0, true);
        for _ in 0..11 {
            limiter.check("1.2.3.4:5000");
        }

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 11);
        assert_eq!(stats.blocked_requests, 1);
        assert_eq!(stats.active_clients, 1);
    }

    #[test]
    fn reset_stats_keeps_buckets() {
        let limiter = RateLimiter::new(5.0, 10.0, true);
        for _ in 0..5 {
            limiter.check("10.0.0.1");
        }
        limiter.reset_stats();

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.blocked_requests, 0);
        assert_eq!(stats.active_clients, 1);
    }

    #[test]
    fn extract_ip_handles_both_forms() {
        assert_eq!(extract_ip("10.0.0.1:443"), "10.0.0.1");
        assert_eq!(extract_ip("10.0.0.1"), "10.0.0.1");
        assert_eq!(extract_ip("[::1]:8080"), "[::1]");
    }
}
