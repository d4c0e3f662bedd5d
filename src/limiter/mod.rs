pub mod distributed;
pub mod key;
pub mod shard;
pub mod sliding_window;
pub mod tiered;
pub mod token_bucket;

pub use distributed::DistributedWindowLimiter;
pub use key::KeyStrategy;
pub use shard::ShardedMap;
pub use sliding_window::SlidingWindowLimiter;
pub use tiered::TieredLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Outcome of a rate-limit admission check, carrying everything the
/// middleware needs for the `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Configured ceiling, reported as `X-RateLimit-Limit`.
    pub limit: u64,
    /// Requests left in the current window/bucket.
    pub remaining: u64,
    /// When the limit resets, reported as unix seconds.
    pub reset_at: SystemTime,
    /// Suggested wait before retrying; only meaningful on rejection.
    pub retry_after: Duration,
}

impl Decision {
    pub fn allow(limit: u64, remaining: u64, reset_at: SystemTime) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(limit: u64, reset_at: SystemTime, retry_after: Duration) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
            // Retry-After is always at least one second on the wire.
            retry_after: retry_after.max(Duration::from_secs(1)),
        }
    }

    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs().max(1)
    }
}
