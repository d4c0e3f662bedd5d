use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Route-scoped registry: `route_id → Arc<T>`.
///
/// Every per-route feature (rate limiters, throttlers, verifiers, composed
/// handlers, ...) keeps its compiled per-route instance here so that add /
/// lookup / metrics collection work the same way across features. Lookups on
/// the request path take the read lock; mutation happens only at config
/// (re)load time under the write lock.
pub struct RouteRegistry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> RouteRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, route_id: &str, value: Arc<T>) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(route_id.to_string(), value);
    }

    pub fn get(&self, route_id: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(route_id)
            .cloned()
    }

    /// Remove a route's entry, returning it so the caller can stop any
    /// background work the instance owns.
    pub fn remove(&self, route_id: &str) -> Option<Arc<T>> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(route_id)
    }

    pub fn range<F: FnMut(&str, &Arc<T>)>(&self, mut f: F) {
        let entries = self.entries.read().expect("registry lock poisoned");
        for (route_id, value) in entries.iter() {
            f(route_id, value);
        }
    }

    pub fn route_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Collect one stats value per route, e.g. for the admin surface.
    pub fn collect_stats<S, F: Fn(&T) -> S>(&self, f: F) -> HashMap<String, S> {
        let entries = self.entries.read().expect("registry lock poisoned");
        entries
            .iter()
            .map(|(route_id, value)| (route_id.clone(), f(value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RouteRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
