use std::collections::HashMap;
use std::sync::Mutex;

/// Number of lock stripes. Fixed so the shard pick is a mask-free modulo of
/// a cheap inline hash.
pub const SHARD_COUNT: usize = 64;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

#[inline]
fn fnv1a(key: &str) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Lock-striped `key → V` map backing every per-key limiter.
///
/// 64 fixed shards, each an exclusively locked `HashMap`. Keys are hashed in
/// place (FNV-1a over the borrowed `&str`); an owned `String` is only
/// allocated when a new entry is inserted. Values are cloned out, so callers
/// store `Arc`-wrapped state and mutate through the value's own lock or
/// atomics.
pub struct ShardedMap<V> {
    shards: Vec<Mutex<HashMap<String, V>>>,
}

impl<V: Clone> ShardedMap<V> {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    #[inline]
    fn shard(&self, key: &str) -> &Mutex<HashMap<String, V>> {
        &self.shards[(fnv1a(key) % SHARD_COUNT as u64) as usize]
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key)
            .lock()
            .expect("shard lock poisoned")
            .get(key)
            .cloned()
    }

    /// Fetch the value for `key`, inserting `init()` if absent. `init` runs
    /// under the shard lock — keep it cheap.
    pub fn get_or_create<F: FnOnce() -> V>(&self, key: &str, init: F) -> V {
        let mut shard = self.shard(key).lock().expect("shard lock poisoned");
        if let Some(value) = shard.get(key) {
            return value.clone();
        }
        let value = init();
        shard.insert(key.to_string(), value.clone());
        value
    }

    pub fn set(&self, key: &str, value: V) {
        self.shard(key)
            .lock()
            .expect("shard lock poisoned")
            .insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.shard(key)
            .lock()
            .expect("shard lock poisoned")
            .remove(key)
    }

    /// Remove every entry for which `pred` returns true. Shards are swept one
    /// at a time so readers on other stripes are not blocked.
    pub fn delete_if<F: FnMut(&str, &V) -> bool>(&self, mut pred: F) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock().expect("shard lock poisoned");
            let before = map.len();
            map.retain(|key, value| !pred(key, value));
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("shard lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for ShardedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}
