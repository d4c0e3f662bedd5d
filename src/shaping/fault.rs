use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct FaultStats {
    pub requests: AtomicU64,
    pub delayed: AtomicU64,
    pub aborted: AtomicU64,
    pub total_delay_ns: AtomicU64,
}

/// What the injector decided for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Respond immediately with this status; the handler must not run.
    Aborted(u16),
    /// The injected delay has already been slept out.
    Delayed,
    None,
}

/// Probabilistic fault injection for resilience testing.
///
/// Each request first rolls the abort percentage — a hit short-circuits with
/// the configured status and never sleeps. Otherwise the delay percentage is
/// rolled and a hit sleeps `delay` (the caller's request context bounds the
/// sleep by dropping the future on cancellation). The RNG sits behind a
/// mutex so the roll allocates nothing per call.
pub struct FaultInjector {
    abort_pct: f64,
    abort_status: u16,
    delay_pct: f64,
    delay: Duration,
    rng: Mutex<StdRng>,
    pub stats: FaultStats,
}

impl FaultInjector {
    pub fn new(abort_pct: f64, abort_status: u16, delay_pct: f64, delay: Duration) -> Self {
        Self {
            abort_pct: abort_pct.clamp(0.0, 100.0),
            abort_status,
            delay_pct: delay_pct.clamp(0.0, 100.0),
            delay,
            rng: Mutex::new(StdRng::from_entropy()),
            stats: FaultStats::default(),
        }
    }

    fn roll(&self, pct: f64) -> bool {
        if pct <= 0.0 {
            return false;
        }
        if pct >= 100.0 {
            return true;
        }
        self.rng.lock().expect("fault rng lock poisoned").gen::<f64>() * 100.0 < pct
    }

    pub async fn apply(&self) -> FaultOutcome {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        if self.roll(self.abort_pct) {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            return FaultOutcome::Aborted(self.abort_status);
        }

        if self.roll(self.delay_pct) && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
            self.stats.delayed.fetch_add(1, Ordering::Relaxed);
            self.stats
                .total_delay_ns
                .fetch_add(self.delay.as_nanos() as u64, Ordering::Relaxed);
            return FaultOutcome::Delayed;
        }

        FaultOutcome::None
    }
}
