use super::shard::ShardedMap;
use super::Decision;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Per-key token bucket limiter.
///
/// Each key refills at `rate / period` tokens per second, capped at `burst`.
/// A full bucket of size B admits exactly B back-to-back requests; the next
/// one is denied with the time until a whole token accrues.
pub struct TokenBucketLimiter {
    rate: f64,
    period: Duration,
    burst: f64,
    buckets: ShardedMap<Arc<Mutex<BucketState>>>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucketLimiter {
    /// `rate` requests per `period` (default 1 minute) with up to `burst`
    /// requests of slack (default `rate`).
    pub fn new(rate: u64, period: Option<Duration>, burst: Option<u64>) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate,
            period: period.unwrap_or(Duration::from_secs(60)),
            burst: burst.map(|b| b.max(1) as f64).unwrap_or(rate),
            buckets: ShardedMap::new(),
        }
    }

    #[inline]
    fn rate_per_sec(&self) -> f64 {
        self.rate / self.period.as_secs_f64()
    }

    pub fn allow(&self, key: &str) -> Decision {
        let bucket = self.buckets.get_or_create(key, || {
            Arc::new(Mutex::new(BucketState {
                tokens: self.burst,
                last: Instant::now(),
            }))
        });

        let rate_per_sec = self.rate_per_sec();
        let now = Instant::now();
        let mut state = bucket.lock().expect("bucket lock poisoned");

        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate_per_sec).min(self.burst);
        state.last = now;

        let limit = self.burst as u64;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            let until_full = Duration::from_secs_f64((self.burst - state.tokens) / rate_per_sec);
            Decision::allow(limit, state.tokens as u64, SystemTime::now() + until_full)
        } else {
            let until_token = Duration::from_secs_f64((1.0 - state.tokens) / rate_per_sec);
            Decision::deny(limit, SystemTime::now() + until_token, until_token)
        }
    }

    /// Drop buckets that have been idle long enough to refill completely.
    pub fn evict_idle(&self) -> usize {
        let rate_per_sec = self.rate_per_sec();
        let burst = self.burst;
        self.buckets.delete_if(|_, bucket| {
            let state = bucket.lock().expect("bucket lock poisoned");
            let refilled =
                state.tokens + state.last.elapsed().as_secs_f64() * rate_per_sec;
            refilled >= burst
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_admits_exactly_burst() {
        let limiter = TokenBucketLimiter::new(10, Some(Duration::from_secs(60)), Some(5));

        for i in 0..5 {
            let d = limiter.allow("k");
            assert!(d.allowed, "request {} should pass", i);
        }
        let denied = limiter.allow("k");
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs() >= 1);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn test_burst_defaults_to_rate() {
        let limiter = TokenBucketLimiter::new(3, None, None);
        assert!(limiter.allow("k").allowed);
        assert!(limiter.allow("k").allowed);
        assert!(limiter.allow("k").allowed);
        assert!(!limiter.allow("k").allowed);
    }

    #[test]
    fn test_refill_restores_tokens() {
        // 100 tokens per second, burst 1: ~10ms per token.
        let limiter = TokenBucketLimiter::new(100, Some(Duration::from_secs(1)), Some(1));
        assert!(limiter.allow("k").allowed);
        assert!(!limiter.allow("k").allowed);

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(60, None, Some(1));
        assert!(limiter.allow("a").allowed);
        assert!(!limiter.allow("a").allowed);
        assert!(limiter.allow("b").allowed);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = TokenBucketLimiter::new(60, None, Some(3));
        assert_eq!(limiter.allow("k").remaining, 2);
        assert_eq!(limiter.allow("k").remaining, 1);
        assert_eq!(limiter.allow("k").remaining, 0);
    }

    #[test]
    fn test_evict_idle_removes_full_buckets() {
        let limiter = TokenBucketLimiter::new(1000, Some(Duration::from_secs(1)), Some(1));
        limiter.allow("gone");
        assert_eq!(limiter.tracked_keys(), 1);

        // After a few ms the single-token bucket has refilled completely.
        std::thread::sleep(Duration::from_millis(20));
        let evicted = limiter.evict_idle();
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_denied_reset_is_in_the_future() {
        let limiter = TokenBucketLimiter::new(1, Some(Duration::from_secs(60)), Some(1));
        limiter.allow("k");
        let denied = limiter.allow("k");
        assert!(!denied.allowed);
        assert!(denied.reset_at > SystemTime::now());
    }
}
