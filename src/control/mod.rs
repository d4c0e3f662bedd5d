pub mod client;
pub mod proto;
pub mod server;
pub mod version;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// How often the sweeper looks for silent nodes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// A node is stale after missing this many heartbeat intervals.
const STALE_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigSource {
    File,
    AdminApi,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::File => "file",
            ConfigSource::AdminApi => "admin-api",
        }
    }
}

/// The unit of configuration distribution. `config` is the parsed form,
/// opaque to the sync protocol itself.
#[derive(Debug, Clone)]
pub struct ConfigEnvelope {
    pub version: u64,
    pub hash: u64,
    pub yaml: Bytes,
    pub timestamp: DateTime<Utc>,
    pub source: ConfigSource,
    pub config: Option<Arc<serde_json::Value>>,
}

/// Hash used for config envelopes when the caller does not supply one
/// (FNV-1a over the raw yaml).
pub fn envelope_hash(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl ConfigEnvelope {
    pub fn empty() -> Self {
        Self {
            version: 0,
            hash: 0,
            yaml: Bytes::new(),
            timestamp: Utc::now(),
            source: ConfigSource::File,
            config: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Connected,
    Stale,
}

/// One connected data plane, tracked for the admin surface and staleness
/// detection. Mutated only under the control-plane lock.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectedNode {
    pub node_id: String,
    pub hostname: String,
    pub version: String,
    pub config_version: u64,
    pub config_hash: u64,
    pub node_status: String,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip)]
    pub last_heartbeat_at: Instant,
    pub status: NodeStatus,
    pub last_sent_version: u64,
}

struct Inner {
    current: Arc<ConfigEnvelope>,
    nodes: HashMap<String, ConnectedNode>,
}

/// Versioned config store plus the registry of connected data planes.
///
/// `push_config` swaps the current envelope under the lock, then bumps the
/// version watch — every stream blocked on the previous version wakes
/// exactly once; the per-stream `last_sent_version` guard makes each version
/// sent at most once per stream.
pub struct ControlPlane {
    inner: Mutex<Inner>,
    version_tx: watch::Sender<u64>,
    heartbeat_interval: Duration,
    shutdown: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ControlPlane {
    pub fn new(heartbeat_interval: Duration) -> Arc<Self> {
        let (version_tx, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner {
                current: Arc::new(ConfigEnvelope::empty()),
                nodes: HashMap::new(),
            }),
            version_tx,
            heartbeat_interval,
            shutdown: Notify::new(),
            sweeper: Mutex::new(None),
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Replace the current envelope. A zero version is assigned
    /// `previous + 1`; an explicit version is taken as-is.
    pub fn push_config(&self, mut envelope: ConfigEnvelope) -> u64 {
        let version = {
            let mut inner = self.inner.lock().expect("control plane lock poisoned");
            if envelope.version == 0 {
                envelope.version = inner.current.version + 1;
            }
            envelope.timestamp = Utc::now();
            let version = envelope.version;
            inner.current = Arc::new(envelope);
            version
        };
        // Wake every stream waiting on the previous version, exactly once.
        let _ = self.version_tx.send(version);
        info!("control: config pushed, version={}", version);
        version
    }

    pub fn current_config(&self) -> Arc<ConfigEnvelope> {
        self.inner
            .lock()
            .expect("control plane lock poisoned")
            .current
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    // -- node registry ---------------------------------------------------------

    /// Register a node at stream open. Returns the current envelope so the
    /// caller can decide on the initial send while still consistent with the
    /// registration.
    pub fn register_node(
        &self,
        node_id: &str,
        hostname: &str,
        version: &str,
        config_hash: u64,
    ) -> Arc<ConfigEnvelope> {
        let mut inner = self.inner.lock().expect("control plane lock poisoned");
        inner.nodes.insert(
            node_id.to_string(),
            ConnectedNode {
                node_id: node_id.to_string(),
                hostname: hostname.to_string(),
                version: version.to_string(),
                config_version: 0,
                config_hash,
                node_status: String::new(),
                last_heartbeat: Utc::now(),
                last_heartbeat_at: Instant::now(),
                status: NodeStatus::Connected,
                last_sent_version: 0,
            },
        );
        inner.current.clone()
    }

    pub fn record_heartbeat(
        &self,
        node_id: &str,
        config_version: u64,
        config_hash: u64,
        node_status: &str,
    ) {
        let mut inner = self.inner.lock().expect("control plane lock poisoned");
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.last_heartbeat = Utc::now();
            node.last_heartbeat_at = Instant::now();
            node.config_version = config_version;
            node.config_hash = config_hash;
            node.node_status = node_status.to_string();
            node.status = NodeStatus::Connected;
        }
    }

    pub fn record_sent(&self, node_id: &str, version: u64) {
        let mut inner = self.inner.lock().expect("control plane lock poisoned");
        if let Some(node) = inner.nodes.get_mut(node_id) {
            node.last_sent_version = version;
        }
    }

    pub fn remove_node(&self, node_id: &str) {
        let mut inner = self.inner.lock().expect("control plane lock poisoned");
        if inner.nodes.remove(node_id).is_some() {
            info!("control: node removed, node_id={}", node_id);
        }
    }

    pub fn nodes(&self) -> Vec<ConnectedNode> {
        self.inner
            .lock()
            .expect("control plane lock poisoned")
            .nodes
            .values()
            .cloned()
            .collect()
    }

    // -- staleness -------------------------------------------------------------

    /// Mark nodes that have missed three heartbeat intervals.
    pub fn sweep_stale(&self) -> usize {
        let threshold = self.heartbeat_interval * STALE_MULTIPLIER;
        let mut inner = self.inner.lock().expect("control plane lock poisoned");
        let mut marked = 0;
        for node in inner.nodes.values_mut() {
            if node.status == NodeStatus::Connected
                && node.last_heartbeat_at.elapsed() > threshold
            {
                node.status = NodeStatus::Stale;
                marked += 1;
            }
        }
        marked
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().expect("sweeper lock poisoned");
        if slot.is_some() {
            return;
        }
        let plane = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let marked = plane.sweep_stale();
                        if marked > 0 {
                            tracing::warn!("control: {} nodes marked stale", marked);
                        }
                    }
                    _ = plane.shutdown.notified() => return,
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> Arc<ControlPlane> {
        ControlPlane::new(Duration::from_secs(10))
    }

    fn envelope(version: u64, hash: u64, yaml: &str) -> ConfigEnvelope {
        ConfigEnvelope {
            version,
            hash,
            yaml: Bytes::copy_from_slice(yaml.as_bytes()),
            timestamp: Utc::now(),
            source: ConfigSource::AdminApi,
            config: None,
        }
    }

    #[test]
    fn test_push_assigns_monotonic_versions() {
        let plane = plane();

        assert_eq!(plane.push_config(envelope(0, 42, "routes: []")), 1);
        let current = plane.current_config();
        assert_eq!(current.version, 1);
        assert_eq!(current.hash, 42);

        assert_eq!(plane.push_config(envelope(0, 43, "routes: [a]")), 2);
        assert_eq!(plane.push_config(envelope(10, 44, "routes: [b]")), 10);
        assert_eq!(plane.current_config().version, 10);
    }

    #[tokio::test]
    async fn test_push_wakes_all_subscribers_once() {
        let plane = plane();
        let mut rx1 = plane.subscribe();
        let mut rx2 = plane.subscribe();

        plane.push_config(envelope(0, 1, "a: 1"));

        tokio::time::timeout(Duration::from_millis(100), rx1.changed())
            .await
            .expect("rx1 should wake")
            .unwrap();
        tokio::time::timeout(Duration::from_millis(100), rx2.changed())
            .await
            .expect("rx2 should wake")
            .unwrap();
        assert_eq!(*rx1.borrow(), 1);

        // No second wake without a second push.
        assert!(
            tokio::time::timeout(Duration::from_millis(50), rx1.changed())
                .await
                .is_err()
        );
    }

    #[test]
    fn test_node_registration_and_heartbeat() {
        let plane = plane();
        plane.push_config(envelope(0, 7, "x: 1"));

        let current = plane.register_node("n1", "gw-0", "1.4.0", 0);
        assert_eq!(current.version, 1);

        plane.record_heartbeat("n1", 1, 7, "ok");
        let nodes = plane.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].config_version, 1);
        assert_eq!(nodes[0].node_status, "ok");
        assert_eq!(nodes[0].status, NodeStatus::Connected);

        plane.remove_node("n1");
        assert!(plane.nodes().is_empty());
    }

    #[test]
    fn test_stale_sweep_marks_silent_nodes() {
        let plane = ControlPlane::new(Duration::from_millis(1));
        plane.register_node("n1", "gw-0", "1.0.0", 0);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(plane.sweep_stale(), 1);
        assert_eq!(plane.nodes()[0].status, NodeStatus::Stale);

        // A heartbeat revives the node.
        plane.record_heartbeat("n1", 0, 0, "ok");
        assert_eq!(plane.nodes()[0].status, NodeStatus::Connected);
        assert_eq!(plane.sweep_stale(), 1);
    }

    #[test]
    fn test_record_sent_guards_version() {
        let plane = plane();
        plane.register_node("n1", "h", "1.0.0", 0);
        plane.record_sent("n1", 5);
        assert_eq!(plane.nodes()[0].last_sent_version, 5);
    }
}
