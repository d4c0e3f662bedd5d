use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_limit: u64,
    pub max_limit: u64,
    /// Gradient (ewma / min latency) above which the limiter backs off.
    pub tolerance: f64,
    /// EWMA smoothing factor.
    pub alpha: f64,
    pub min_samples: u64,
    pub adjustment_interval: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_limit: 1,
            max_limit: 1000,
            tolerance: 1.5,
            alpha: 0.2,
            min_samples: 10,
            adjustment_interval: Duration::from_secs(5),
        }
    }
}

struct SampleState {
    ewma_ns: f64,
    min_ns: f64,
    count: u64,
}

/// Vegas-inspired AIMD concurrency limiter.
///
/// Admission is an optimistic atomic increment of `inflight` compared against
/// `current_limit`; the rejection path undoes the increment before returning.
/// Successful (2xx/3xx) request latencies feed an EWMA; the adjuster task
/// compares it against the observed baseline minimum every interval and grows
/// the limit additively while the gradient is inside tolerance, or shrinks it
/// multiplicatively once queuing shows up.
pub struct AdaptiveLimiter {
    config: AdaptiveConfig,
    current_limit: AtomicU64,
    inflight: AtomicU64,
    samples: Mutex<SampleState>,
    shutdown: Notify,
    adjuster: Mutex<Option<JoinHandle<()>>>,
}

/// In-flight slot. Call `release` with the response status and measured
/// latency; dropping without releasing frees the slot without sampling.
pub struct AdaptivePermit {
    limiter: Arc<AdaptiveLimiter>,
    released: bool,
}

impl AdaptivePermit {
    pub fn release(mut self, status: u16, latency: Duration) {
        self.released = true;
        self.limiter.on_release(Some((status, latency)));
    }
}

impl Drop for AdaptivePermit {
    fn drop(&mut self) {
        if !self.released {
            self.limiter.on_release(None);
        }
    }
}

impl AdaptiveLimiter {
    pub fn new(config: AdaptiveConfig) -> Arc<Self> {
        let start_limit = config.max_limit.max(1);
        Arc::new(Self {
            config,
            current_limit: AtomicU64::new(start_limit),
            inflight: AtomicU64::new(0),
            samples: Mutex::new(SampleState {
                ewma_ns: 0.0,
                min_ns: 0.0,
                count: 0,
            }),
            shutdown: Notify::new(),
            adjuster: Mutex::new(None),
        })
    }

    /// Optimistically claim an in-flight slot. `None` means the route is at
    /// its current concurrency limit.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdaptivePermit> {
        let inflight = self.inflight.fetch_add(1, Ordering::AcqRel) + 1;
        if inflight > self.current_limit.load(Ordering::Acquire) {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(AdaptivePermit {
            limiter: Arc::clone(self),
            released: false,
        })
    }

    fn on_release(&self, outcome: Option<(u16, Duration)>) {
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        let Some((status, latency)) = outcome else {
            return;
        };
        // Only clean responses say anything about service latency; errors and
        // shed load would poison the baseline.
        if !(200..400).contains(&status) {
            return;
        }
        let sample_ns = latency.as_nanos() as f64;
        let mut s = self.samples.lock().expect("adaptive samples lock poisoned");
        if s.count == 0 && s.ewma_ns == 0.0 {
            s.ewma_ns = sample_ns;
        } else {
            s.ewma_ns = self.config.alpha * sample_ns + (1.0 - self.config.alpha) * s.ewma_ns;
        }
        if s.min_ns <= 0.0 || sample_ns < s.min_ns {
            s.min_ns = sample_ns;
        } else {
            // Let the baseline drift toward the EWMA so an ancient minimum
            // cannot keep the limiter in permanent backoff.
            s.min_ns += (s.ewma_ns - s.min_ns) * 0.01;
        }
        s.count += 1;
    }

    fn adjust(&self) {
        let (ewma, min, count) = {
            let s = self.samples.lock().expect("adaptive samples lock poisoned");
            (s.ewma_ns, s.min_ns, s.count)
        };
        if count < self.config.min_samples || min <= 0.0 {
            return;
        }

        let limit = self.current_limit.load(Ordering::Acquire);
        let gradient = ewma / min;
        let next = if gradient < self.config.tolerance {
            limit + 1
        } else {
            ((limit as f64) * min / ewma) as u64
        };
        let next = next.clamp(self.config.min_limit, self.config.max_limit);
        if next != limit {
            tracing::debug!(
                "adaptive: limit {} -> {} (gradient {:.3})",
                limit,
                next,
                gradient
            );
        }
        self.current_limit.store(next, Ordering::Release);

        self.samples
            .lock()
            .expect("adaptive samples lock poisoned")
            .count = 0;
    }

    /// Spawn the adjustment loop. Idempotent per limiter instance.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.adjuster.lock().expect("adjuster lock poisoned");
        if slot.is_some() {
            return;
        }
        let limiter = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.config.adjustment_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.adjust(),
                    _ = limiter.shutdown.notified() => return,
                }
            }
        }));
    }

    /// Cancel the adjuster and wait for it to finish.
    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.adjuster.lock().expect("adjuster lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn current_limit(&self) -> u64 {
        self.current_limit.load(Ordering::Acquire)
    }

    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }
}
