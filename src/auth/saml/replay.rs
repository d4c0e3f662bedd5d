use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Upper bound on tracked assertion ids before an eviction sweep runs.
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Bounded set of consumed assertion ids.
///
/// A hit means the assertion was already presented and must be rejected
/// outright. Entries expire with the TTL they were recorded with; when the
/// map fills up, expired entries are swept opportunistically on insert.
pub struct ReplayCache {
    entries: Mutex<HashMap<String, Instant>>,
    max_entries: usize,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Record `assertion_id` for `ttl`. Returns false when the id was already
    /// consumed and still live — a replay.
    pub fn check_and_insert(&self, assertion_id: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("replay cache lock poisoned");

        if let Some(expires_at) = entries.get(assertion_id) {
            if *expires_at > now {
                return false;
            }
            // Expired id: the assertion it belonged to can no longer validate
            // either, so reuse of the slot is safe.
        }

        if entries.len() >= self.max_entries {
            entries.retain(|_, expires_at| *expires_at > now);
        }

        entries.insert(assertion_id.to_string(), now + ttl);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("replay cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_id_accepted_once() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert("a1", Duration::from_secs(60)));
        assert!(!cache.check_and_insert("a1", Duration::from_secs(60)));
    }

    #[test]
    fn test_expired_id_can_be_reused() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert("a1", Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(cache.check_and_insert("a1", Duration::from_secs(60)));
    }

    #[test]
    fn test_overflow_sweeps_expired() {
        let cache = ReplayCache::with_capacity(3);
        assert!(cache.check_and_insert("dead-1", Duration::from_millis(1)));
        assert!(cache.check_and_insert("dead-2", Duration::from_millis(1)));
        assert!(cache.check_and_insert("live-1", Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));

        // At capacity: inserting sweeps the two expired entries first.
        assert!(cache.check_and_insert("live-2", Duration::from_secs(60)));
        assert_eq!(cache.len(), 2);
        assert!(!cache.check_and_insert("live-1", Duration::from_secs(60)));
    }

    #[test]
    fn test_distinct_ids_are_independent() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert("a", Duration::from_secs(60)));
        assert!(cache.check_and_insert("b", Duration::from_secs(60)));
        assert_eq!(cache.len(), 2);
    }
}
