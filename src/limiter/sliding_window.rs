use super::shard::ShardedMap;
use super::Decision;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Per-key sliding window counter.
///
/// Two adjacent fixed windows per key; the admission estimate blends the
/// previous window's count by how much of it still overlaps the sliding
/// window: `prev · (1 − elapsed/period) + curr`. This avoids the classic
/// fixed-window edge where two adjacent windows admit 2× the limit around
/// the boundary.
pub struct SlidingWindowLimiter {
    limit: u64,
    period: Duration,
    windows: ShardedMap<Arc<Mutex<WindowState>>>,
}

struct WindowState {
    prev: u64,
    curr: u64,
    curr_start: Instant,
    last_used: Instant,
}

impl SlidingWindowLimiter {
    /// The effective limit is `max(rate, burst)` per `period` (default 1
    /// minute).
    pub fn new(rate: u64, period: Option<Duration>, burst: Option<u64>) -> Self {
        Self {
            limit: rate.max(burst.unwrap_or(0)).max(1),
            period: period.unwrap_or(Duration::from_secs(60)),
            windows: ShardedMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> Decision {
        let window = self.windows.get_or_create(key, || {
            Arc::new(Mutex::new(WindowState {
                prev: 0,
                curr: 0,
                curr_start: Instant::now(),
                last_used: Instant::now(),
            }))
        });

        let now = Instant::now();
        let mut w = window.lock().expect("window lock poisoned");
        w.last_used = now;

        // Rotate expired windows; a long pause may need several rotations.
        let mut rotations = 0u32;
        while now.saturating_duration_since(w.curr_start) >= self.period {
            w.prev = w.curr;
            w.curr = 0;
            w.curr_start += self.period;
            rotations += 1;
        }
        if rotations > 1 {
            // More than two periods elapsed: the previous window is stale.
            w.prev = 0;
        }

        let elapsed = now.saturating_duration_since(w.curr_start).as_secs_f64();
        let weight = 1.0 - (elapsed / self.period.as_secs_f64()).min(1.0);
        let estimate = w.prev as f64 * weight + w.curr as f64;

        let reset_at = SystemTime::now()
            + self
                .period
                .saturating_sub(now.saturating_duration_since(w.curr_start));

        if estimate < self.limit as f64 {
            w.curr += 1;
            let remaining = (self.limit as f64 - estimate - 1.0).max(0.0) as u64;
            Decision::allow(self.limit, remaining, reset_at)
        } else {
            let retry_after = self
                .period
                .saturating_sub(now.saturating_duration_since(w.curr_start));
            Decision::deny(self.limit, reset_at, retry_after)
        }
    }

    /// Drop windows idle for at least `idle_for`.
    pub fn evict_idle(&self, idle_for: Duration) -> usize {
        self.windows.delete_if(|_, window| {
            window
                .lock()
                .expect("window lock poisoned")
                .last_used
                .elapsed()
                >= idle_for
        })
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
