use crate::limiter::shard::ShardedMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Key used for the shared bucket when per-IP mode is off.
const GLOBAL_KEY: &str = "_global";

/// How often the eviction task scans for idle per-IP limiters.
const EVICTION_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    /// The wait needed to acquire a token exceeds `max_wait`.
    Timeout,
}

impl std::fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "throttle wait exceeded max_wait")
    }
}

impl std::error::Error for ThrottleError {}

#[derive(Debug, Default)]
pub struct ThrottleStats {
    pub total: AtomicU64,
    /// Requests that waited longer than 1 ms for a token.
    pub throttled: AtomicU64,
    pub timed_out: AtomicU64,
    pub total_wait_ns: AtomicU64,
}

impl ThrottleStats {
    pub fn avg_wait(&self) -> Duration {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_wait_ns.load(Ordering::Relaxed) / total)
    }
}

struct WaitBucket {
    /// May go negative: a waiter reserves its token up front and sleeps out
    /// the deficit, which keeps admission ordering fair under contention.
    tokens: f64,
    last: Instant,
}

/// Wait-based token bucket: instead of rejecting over-rate requests it delays
/// them, up to `max_wait`, smoothing bursts into the configured rate.
///
/// In per-IP mode each extracted client IP gets its own bucket; a background
/// task evicts buckets that have refilled completely (idle clients) every
/// five minutes.
pub struct Throttler {
    rate_per_sec: f64,
    burst: f64,
    max_wait: Duration,
    per_ip: bool,
    buckets: ShardedMap<Arc<Mutex<WaitBucket>>>,
    pub stats: ThrottleStats,
    shutdown: Notify,
}

impl Throttler {
    pub fn new(rate_per_sec: f64, burst: u64, max_wait: Duration, per_ip: bool) -> Self {
        Self {
            rate_per_sec: rate_per_sec.max(f64::MIN_POSITIVE),
            burst: burst.max(1) as f64,
            max_wait,
            per_ip,
            buckets: ShardedMap::new(),
            stats: ThrottleStats::default(),
            shutdown: Notify::new(),
        }
    }

    fn bucket_for(&self, client_ip: IpAddr) -> Arc<Mutex<WaitBucket>> {
        let key_buf;
        let key = if self.per_ip {
            key_buf = client_ip.to_string();
            key_buf.as_str()
        } else {
            GLOBAL_KEY
        };
        self.buckets.get_or_create(key, || {
            Arc::new(Mutex::new(WaitBucket {
                tokens: self.burst,
                last: Instant::now(),
            }))
        })
    }

    /// Acquire one token, sleeping while the bucket refills. Returns
    /// `ThrottleError::Timeout` without sleeping when the required wait
    /// already exceeds `max_wait`. Dropping the future cancels the wait.
    pub async fn acquire(&self, client_ip: IpAddr) -> Result<(), ThrottleError> {
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let bucket = self.bucket_for(client_ip);

        let wait = {
            let now = Instant::now();
            let mut b = bucket.lock().expect("throttle bucket lock poisoned");
            let elapsed = now.saturating_duration_since(b.last).as_secs_f64();
            b.tokens = (b.tokens + elapsed * self.rate_per_sec).min(self.burst);
            b.last = now;

            if b.tokens >= 1.0 {
                b.tokens -= 1.0;
                Duration::ZERO
            } else {
                let wait = Duration::from_secs_f64((1.0 - b.tokens) / self.rate_per_sec);
                if wait > self.max_wait {
                    self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                    return Err(ThrottleError::Timeout);
                }
                b.tokens -= 1.0;
                wait
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
            self.stats
                .total_wait_ns
                .fetch_add(wait.as_nanos() as u64, Ordering::Relaxed);
            if wait > Duration::from_millis(1) {
                self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Spawn the idle-bucket eviction loop. Only useful in per-IP mode where
    /// the key space grows with the client population.
    pub fn start_eviction(self: &Arc<Self>) {
        if !self.per_ip {
            return;
        }
        let throttler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = throttler.evict_idle();
                        if evicted > 0 {
                            tracing::debug!("throttle: evicted {} idle limiters", evicted);
                        }
                    }
                    _ = throttler.shutdown.notified() => return,
                }
            }
        });
    }

    pub fn stop(&self) {
        self.shutdown.notify_waiters();
    }

    /// Remove buckets whose tokens have fully refilled — no waiter can be
    /// depending on them.
    fn evict_idle(&self) -> usize {
        let rate = self.rate_per_sec;
        let burst = self.burst;
        self.buckets.delete_if(|key, bucket| {
            if key == GLOBAL_KEY {
                return false;
            }
            let b = bucket.lock().expect("throttle bucket lock poisoned");
            b.tokens + b.last.elapsed().as_secs_f64() * rate >= burst
        })
    }

    pub fn tracked_limiters(&self) -> usize {
        self.buckets.len()
    }
}
