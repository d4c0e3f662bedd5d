use crate::auth::Identity;
use http::HeaderMap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Fallback admission level when neither the tenant nor any rule decides.
pub const DEFAULT_LEVEL: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The waiter's deadline passed while queued.
    QueueTimeout,
    /// The admitter was torn down while the waiter was queued.
    Closed,
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::QueueTimeout => write!(f, "admission queue wait timed out"),
            AdmitError::Closed => write!(f, "priority admitter closed"),
        }
    }
}

impl std::error::Error for AdmitError {}

#[derive(Debug)]
struct Waiter {
    level: u32,
    seq: u64,
    id: u64,
    tx: oneshot::Sender<()>,
}

// BinaryHeap is a max-heap; invert the ordering so the lowest level (highest
// priority) pops first, FIFO within a level via the admission sequence.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .level
            .cmp(&self.level)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Waiter {}

#[derive(Debug)]
struct AdmitState {
    active: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct AdmitStats {
    pub admitted: AtomicU64,
    pub queued: AtomicU64,
    pub rejected: AtomicU64,
}

/// Bounded-concurrency admitter with priority queueing.
///
/// An available slot admits immediately; otherwise the request waits in a
/// min-heap keyed by level (lower level = higher priority, FIFO within a
/// level). A released slot is handed directly to the best waiter — `active`
/// never dips below the true concurrency, so a burst of releases cannot
/// over-admit through a transient undercount.
#[derive(Debug)]
pub struct PriorityAdmitter {
    max_concurrent: usize,
    state: Mutex<AdmitState>,
    pub stats: AdmitStats,
}

/// RAII slot: releasing hands the slot to the next waiter or frees it.
#[derive(Debug)]
pub struct PriorityPermit {
    admitter: Arc<PriorityAdmitter>,
}

impl Drop for PriorityPermit {
    fn drop(&mut self) {
        self.admitter.release_slot();
    }
}

impl PriorityAdmitter {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent: max_concurrent.max(1),
            state: Mutex::new(AdmitState {
                active: 0,
                queue: BinaryHeap::new(),
                next_seq: 0,
                next_id: 0,
            }),
            stats: AdmitStats::default(),
        })
    }

    /// Admit at `level`, waiting up to `max_wait` for a slot. A timed-out or
    /// cancelled waiter is removed from the heap and counted as rejected.
    pub async fn admit(
        self: &Arc<Self>,
        level: u32,
        max_wait: Duration,
    ) -> Result<PriorityPermit, AdmitError> {
        let (mut rx, id) = {
            let mut st = self.state.lock().expect("admitter lock poisoned");
            if st.active < self.max_concurrent {
                st.active += 1;
                self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(PriorityPermit {
                    admitter: Arc::clone(self),
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = st.next_id;
            st.next_id += 1;
            let seq = st.next_seq;
            st.next_seq += 1;
            st.queue.push(Waiter { level, seq, id, tx });
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
            (rx, id)
        };

        let sleep = tokio::time::sleep(max_wait);
        tokio::pin!(sleep);

        tokio::select! {
            res = &mut rx => match res {
                Ok(()) => {
                    // Slot handed off directly; `active` already accounts for it.
                    self.stats.admitted.fetch_add(1, Ordering::Relaxed);
                    Ok(PriorityPermit { admitter: Arc::clone(self) })
                }
                Err(_) => Err(AdmitError::Closed),
            },
            _ = &mut sleep => {
                let removed = {
                    let mut st = self.state.lock().expect("admitter lock poisoned");
                    remove_waiter(&mut st.queue, id)
                };
                if !removed {
                    // Already popped by a releaser: the handoff raced the
                    // deadline. Claim the slot if it arrives and release it
                    // so it is not leaked.
                    if rx.await.is_ok() {
                        self.release_slot();
                    }
                }
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(AdmitError::QueueTimeout)
            }
        }
    }

    fn release_slot(&self) {
        let mut st = self.state.lock().expect("admitter lock poisoned");
        // Hand the slot straight to the best live waiter. A send error means
        // that waiter gave up (future dropped) — skip to the next.
        while let Some(waiter) = st.queue.pop() {
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
        st.active = st.active.saturating_sub(1);
    }

    pub fn active(&self) -> usize {
        self.state.lock().expect("admitter lock poisoned").active
    }

    pub fn queue_depth(&self) -> usize {
        self.state.lock().expect("admitter lock poisoned").queue.len()
    }
}

fn remove_waiter(queue: &mut BinaryHeap<Waiter>, id: u64) -> bool {
    let before = queue.len();
    let remaining: BinaryHeap<Waiter> = queue.drain().filter(|w| w.id != id).collect();
    *queue = remaining;
    queue.len() < before
}

/// Static rule: all listed headers must match, or the client id must match.
#[derive(Debug, Clone)]
pub struct PriorityRule {
    pub level: u32,
    pub headers: Vec<(String, String)>,
    pub client_id: Option<String>,
}

/// Picks the admission level for a request: a nonzero tenant-assigned
/// priority wins, else the first matching rule, else the default level.
#[derive(Debug, Clone)]
pub struct LevelSelector {
    rules: Vec<PriorityRule>,
    default_level: u32,
}

impl LevelSelector {
    pub fn new(rules: Vec<PriorityRule>, default_level: Option<u32>) -> Self {
        Self {
            rules,
            default_level: default_level.unwrap_or(DEFAULT_LEVEL),
        }
    }

    pub fn select(
        &self,
        headers: &HeaderMap,
        identity: Option<&Identity>,
        tenant_priority: u32,
    ) -> u32 {
        if tenant_priority != 0 {
            return tenant_priority;
        }
        for rule in &self.rules {
            let headers_match = !rule.headers.is_empty()
                && rule.headers.iter().all(|(name, value)| {
                    headers
                        .get(name.as_str())
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v == value)
                        .unwrap_or(false)
                });
            let client_match = match (&rule.client_id, identity) {
                (Some(want), Some(id)) => id.client_id == *want,
                _ => false,
            };
            if headers_match || client_match {
                return rule.level;
            }
        }
        self.default_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[tokio::test]
    async fn test_admits_up_to_capacity() {
        let admitter = PriorityAdmitter::new(2);
        let p1 = admitter.admit(5, Duration::from_millis(10)).await.unwrap();
        let _p2 = admitter.admit(5, Duration::from_millis(10)).await.unwrap();
        assert_eq!(admitter.active(), 2);

        let denied = admitter.admit(5, Duration::from_millis(10)).await;
        assert_eq!(denied.unwrap_err(), AdmitError::QueueTimeout);
        assert_eq!(admitter.stats.rejected.load(Ordering::Relaxed), 1);

        drop(p1);
        let _p3 = admitter.admit(5, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_higher_priority_waiter_admitted_first() {
        let admitter = PriorityAdmitter::new(1);
        let held = admitter.admit(5, Duration::from_millis(50)).await.unwrap();

        let low = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit(10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let high = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(admitter.queue_depth(), 2);

        // Level-1 entered the queue later but must win the released slot.
        drop(held);
        let high_permit = tokio::time::timeout(Duration::from_millis(100), high)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Level-10 is still queued until the level-1 holder releases.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(admitter.queue_depth(), 1);

        drop(high_permit);
        let low_permit = tokio::time::timeout(Duration::from_millis(100), low)
            .await
            .unwrap()
            .unwrap();
        assert!(low_permit.is_ok());
    }

    #[tokio::test]
    async fn test_fifo_within_level() {
        let admitter = PriorityAdmitter::new(1);
        let held = admitter.admit(5, Duration::from_millis(50)).await.unwrap();

        let results = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..3 {
            let admitter = Arc::clone(&admitter);
            let results = Arc::clone(&results);
            handles.push(tokio::spawn(async move {
                let permit = admitter.admit(5, Duration::from_secs(5)).await.unwrap();
                results.lock().unwrap().push(i);
                drop(permit);
            }));
            // Serialize queue entry order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*results.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_release_skips_abandoned_waiters() {
        let admitter = PriorityAdmitter::new(1);
        let held = admitter.admit(5, Duration::from_millis(50)).await.unwrap();

        // This waiter gives up before the slot frees.
        let gone = admitter.admit(3, Duration::from_millis(10)).await;
        assert!(gone.is_err());

        let live = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit(7, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        assert!(tokio::time::timeout(Duration::from_millis(100), live)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }

    #[tokio::test]
    async fn test_no_transient_undercount() {
        let admitter = PriorityAdmitter::new(1);
        let held = admitter.admit(5, Duration::from_millis(50)).await.unwrap();
        let waiting = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit(5, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(held);
        let permit = waiting.await.unwrap().unwrap();
        // Direct handoff: active never dropped to zero.
        assert_eq!(admitter.active(), 1);
        drop(permit);
        assert_eq!(admitter.active(), 0);
    }

    #[test]
    fn test_level_selector_tenant_wins() {
        let selector = LevelSelector::new(
            vec![PriorityRule {
                level: 1,
                headers: vec![("x-priority".into(), "high".into())],
                client_id: None,
            }],
            Some(4),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-priority", HeaderValue::from_static("high"));

        assert_eq!(selector.select(&headers, None, 2), 2);
        assert_eq!(selector.select(&headers, None, 0), 1);
    }

    #[test]
    fn test_level_selector_client_id_rule() {
        let selector = LevelSelector::new(
            vec![PriorityRule {
                level: 2,
                headers: vec![],
                client_id: Some("vip".into()),
            }],
            None,
        );
        let vip = Identity::new("vip", "api_key");
        let other = Identity::new("other", "api_key");

        assert_eq!(selector.select(&HeaderMap::new(), Some(&vip), 0), 2);
        assert_eq!(
            selector.select(&HeaderMap::new(), Some(&other), 0),
            DEFAULT_LEVEL
        );
    }

    #[test]
    fn test_level_selector_all_headers_must_match() {
        let selector = LevelSelector::new(
            vec![PriorityRule {
                level: 1,
                headers: vec![
                    ("x-a".into(), "1".into()),
                    ("x-b".into(), "2".into()),
                ],
                client_id: None,
            }],
            None,
        );
        let mut partial = HeaderMap::new();
        partial.insert("x-a", HeaderValue::from_static("1"));
        assert_eq!(selector.select(&partial, None, 0), DEFAULT_LEVEL);

        let mut full = partial.clone();
        full.insert("x-b", HeaderValue::from_static("2"));
        assert_eq!(selector.select(&full, None, 0), 1);
    }
}
