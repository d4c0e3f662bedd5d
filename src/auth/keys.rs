use super::{AuthError, Identity};
use crate::limiter::TokenBucketLimiter;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Default printable prefix for generated keys.
const KEY_PREFIX: &str = "rk_";
/// Characters of the raw key kept as the human-visible handle.
const HANDLE_LEN: usize = 8;

/// Optional per-key rate limit installed alongside the key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyRateLimit {
    pub rate: u64,
    #[serde(default)]
    pub period_secs: Option<u64>,
    #[serde(default)]
    pub burst: Option<u64>,
}

/// Stored metadata for one managed API key. The raw key is never stored;
/// only its SHA-256 hash, the first eight characters (admin handle), and a
/// non-reversible masked rendering for listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ManagedKey {
    pub key_hash: String,
    pub key_prefix: String,
    /// `first4****last4` of the raw key, for admin listings.
    pub masked_key: String,
    pub client_id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub rate_limit: Option<KeyRateLimit>,
    /// Hash of the key this one was rotated from.
    pub rotated_from: Option<String>,
    /// After this instant the key no longer authenticates (rotation grace
    /// expired). The sweeper removes it later.
    pub rotation_deadline: Option<DateTime<Utc>>,
}

/// Storage behind the key manager. The in-memory implementation is the
/// reference; a persistent backend only needs these five operations.
pub trait KeyStore: Send + Sync {
    fn get_by_hash(&self, key_hash: &str) -> Option<ManagedKey>;
    fn get_by_prefix(&self, key_prefix: &str) -> Option<ManagedKey>;
    fn put(&self, key: ManagedKey);
    fn remove_by_hash(&self, key_hash: &str) -> Option<ManagedKey>;
    fn list(&self) -> Vec<ManagedKey>;
}

/// In-memory store: hash-indexed map plus a prefix index for admin lookups.
#[derive(Default)]
pub struct InMemoryKeyStore {
    by_hash: DashMap<String, ManagedKey>,
    prefix_index: DashMap<String, String>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn get_by_hash(&self, key_hash: &str) -> Option<ManagedKey> {
        self.by_hash.get(key_hash).map(|e| e.value().clone())
    }

    fn get_by_prefix(&self, key_prefix: &str) -> Option<ManagedKey> {
        let hash = self.prefix_index.get(key_prefix)?.value().clone();
        self.get_by_hash(&hash)
    }

    fn put(&self, key: ManagedKey) {
        self.prefix_index
            .insert(key.key_prefix.clone(), key.key_hash.clone());
        self.by_hash.insert(key.key_hash.clone(), key);
    }

    fn remove_by_hash(&self, key_hash: &str) -> Option<ManagedKey> {
        let (_, key) = self.by_hash.remove(key_hash)?;
        // Only drop the prefix mapping if it still points at this key; a
        // rotation may have reused the handle for the replacement.
        if let Some(entry) = self.prefix_index.get(&key.key_prefix) {
            if entry.value() == key_hash {
                drop(entry);
                self.prefix_index.remove(&key.key_prefix);
            }
        }
        Some(key)
    }

    fn list(&self) -> Vec<ManagedKey> {
        self.by_hash.iter().map(|e| e.value().clone()).collect()
    }
}

/// Parameters for creating a key.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub client_id: String,
    pub name: String,
    pub roles: Vec<String>,
    pub ttl: Option<Duration>,
    pub rate_limit: Option<KeyRateLimit>,
}

pub fn hash_key(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn mask_key(raw: &str) -> String {
    if raw.len() <= 8 {
        return "********".to_string();
    }
    format!("{}****{}", &raw[..4], &raw[raw.len() - 4..])
}

/// Managed API key authority: generation, authentication, rotation with a
/// grace window, revocation, and expiry sweeping. Per-key rate limiters live
/// beside the store, keyed by key hash.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    key_length: usize,
    limiters: DashMap<String, Arc<TokenBucketLimiter>>,
    cleanup_interval: Duration,
    shutdown: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>, key_length: usize, cleanup_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            key_length: key_length.max(16),
            limiters: DashMap::new(),
            cleanup_interval,
            shutdown: Notify::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Create a key and return the raw secret — the only time it exists
    /// outside the caller's hands.
    pub fn generate(&self, req: GenerateRequest) -> (String, ManagedKey) {
        let mut bytes = vec![0u8; self.key_length];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = format!("{}{}", KEY_PREFIX, hex::encode(&bytes));
        let key = self.register(&raw, req, None, None);
        (raw, key)
    }

    /// Register a caller-supplied raw key (admin create surface). Same
    /// storage contract as `generate`: only hash, handle, and mask persist.
    pub fn register_raw(&self, raw: &str, req: GenerateRequest) -> ManagedKey {
        self.register(raw, req, None, None)
    }

    fn register(
        &self,
        raw: &str,
        req: GenerateRequest,
        expires_at: Option<DateTime<Utc>>,
        rotated_from: Option<String>,
    ) -> ManagedKey {
        let now = Utc::now();
        let expires_at = expires_at.or_else(|| {
            req.ttl
                .and_then(|ttl| ChronoDuration::from_std(ttl).ok())
                .map(|ttl| now + ttl)
        });
        let key = ManagedKey {
            key_hash: hash_key(raw),
            key_prefix: raw.chars().take(HANDLE_LEN).collect(),
            masked_key: mask_key(raw),
            client_id: req.client_id,
            name: req.name,
            roles: req.roles,
            created_at: now,
            expires_at,
            revoked: false,
            revoked_at: None,
            last_used_at: None,
            usage_count: 0,
            rate_limit: req.rate_limit.clone(),
            rotated_from,
            rotation_deadline: None,
        };
        if let Some(rl) = &req.rate_limit {
            self.limiters.insert(
                key.key_hash.clone(),
                Arc::new(TokenBucketLimiter::new(
                    rl.rate,
                    rl.period_secs.map(Duration::from_secs),
                    rl.burst,
                )),
            );
        }
        self.store.put(key.clone());
        key
    }

    /// Authenticate a raw key. The outcome order decides the HTTP status:
    /// unknown (401), revoked (403), expired or past the rotation grace
    /// (401), per-key limit (429), success.
    pub fn authenticate(&self, raw: &str) -> Result<Identity, AuthError> {
        let hash = hash_key(raw);
        let Some(mut key) = self.store.get_by_hash(&hash) else {
            return Err(AuthError::InvalidCredentials("invalid API key".into()));
        };

        if key.revoked {
            return Err(AuthError::Forbidden("API key revoked".into()));
        }

        let now = Utc::now();
        if key.expires_at.is_some_and(|at| at <= now) {
            return Err(AuthError::InvalidCredentials("API key expired".into()));
        }
        if key.rotation_deadline.is_some_and(|at| at <= now) {
            return Err(AuthError::InvalidCredentials(
                "API key rotated out".into(),
            ));
        }

        if let Some(limiter) = self.limiters.get(&hash) {
            let decision = limiter.allow(&hash);
            if !decision.allowed {
                return Err(AuthError::RateLimited {
                    retry_after_secs: decision.retry_after_secs(),
                });
            }
        }

        key.last_used_at = Some(now);
        key.usage_count += 1;
        let mut identity = Identity::new(key.client_id.clone(), "api_key");
        identity.name = Some(key.name.clone());
        identity.roles = key.roles.clone();
        self.store.put(key);
        Ok(identity)
    }

    /// Rotate the key behind `prefix`: a fresh raw key inherits the old
    /// identity and expiry, and the old key keeps authenticating until
    /// `grace` runs out.
    pub fn rotate(&self, prefix: &str, grace: Duration) -> Result<(String, ManagedKey), AuthError> {
        let Some(mut old) = self.store.get_by_prefix(prefix) else {
            return Err(AuthError::InvalidCredentials("unknown key prefix".into()));
        };
        if old.revoked {
            return Err(AuthError::Forbidden(
                "cannot rotate a revoked key".into(),
            ));
        }

        let mut bytes = vec![0u8; self.key_length];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = format!("{}{}", KEY_PREFIX, hex::encode(&bytes));
        let new_key = self.register(
            &raw,
            GenerateRequest {
                client_id: old.client_id.clone(),
                name: old.name.clone(),
                roles: old.roles.clone(),
                ttl: None,
                rate_limit: old.rate_limit.clone(),
            },
            old.expires_at,
            Some(old.key_hash.clone()),
        );

        let deadline = Utc::now()
            + ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::hours(1));
        old.rotation_deadline = Some(deadline);
        self.store.put(old);

        Ok((raw, new_key))
    }

    pub fn revoke(&self, prefix: &str) -> Result<(), AuthError> {
        self.update_by_prefix(prefix, |key| {
            key.revoked = true;
            key.revoked_at = Some(Utc::now());
        })
    }

    pub fn unrevoke(&self, prefix: &str) -> Result<(), AuthError> {
        self.update_by_prefix(prefix, |key| {
            key.revoked = false;
            key.revoked_at = None;
        })
    }

    /// Remove the key outright and evict its per-key limiter.
    pub fn delete(&self, prefix: &str) -> Result<(), AuthError> {
        let Some(key) = self.store.get_by_prefix(prefix) else {
            return Err(AuthError::InvalidCredentials("unknown key prefix".into()));
        };
        self.store.remove_by_hash(&key.key_hash);
        self.limiters.remove(&key.key_hash);
        Ok(())
    }

    pub fn set_expiry(&self, prefix: &str, expires_at: Option<DateTime<Utc>>) -> Result<(), AuthError> {
        self.update_by_prefix(prefix, |key| key.expires_at = expires_at)
    }

    fn update_by_prefix<F: FnOnce(&mut ManagedKey)>(
        &self,
        prefix: &str,
        f: F,
    ) -> Result<(), AuthError> {
        let Some(mut key) = self.store.get_by_prefix(prefix) else {
            return Err(AuthError::InvalidCredentials("unknown key prefix".into()));
        };
        f(&mut key);
        self.store.put(key);
        Ok(())
    }

    pub fn list(&self) -> Vec<ManagedKey> {
        self.store.list()
    }

    /// One sweep pass: drop keys past their expiry or rotation deadline.
    /// Live keys are never removed here.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for key in self.store.list() {
            let expired = key.expires_at.is_some_and(|at| at <= now)
                || key.rotation_deadline.is_some_and(|at| at <= now);
            if expired {
                self.store.remove_by_hash(&key.key_hash);
                self.limiters.remove(&key.key_hash);
                removed += 1;
            }
        }
        removed
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().expect("sweeper lock poisoned");
        if slot.is_some() {
            return;
        }
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.cleanup_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = manager.sweep_expired();
                        if removed > 0 {
                            tracing::info!("api keys: swept {} expired keys", removed);
                        }
                    }
                    _ = manager.shutdown.notified() => return,
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

    fn manager() -> Arc<KeyManager> {
        KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            16,
            Duration::from_secs(60),
        )
    }

    fn request(client_id: &str) -> GenerateRequest {
        GenerateRequest {
            client_id: client_id.to_string(),
            name: format!("{} key", client_id),
            roles: vec!["reader".into()],
            ttl: None,
            rate_limit: None,
        }
    }

    #[test]
    fn test_generate_never_stores_raw() {
        let m = manager();
        let (raw, key) = m.generate(request("acme"));

        assert!(raw.starts_with(KEY_PREFIX));
        assert_eq!(key.key_hash, hash_key(&raw));
        assert_eq!(key.key_prefix, &raw[..8]);
        assert!(!key.masked_key.contains(&raw[4..raw.len() - 4]));

        for stored in m.list() {
            assert_ne!(stored.key_hash, raw);
            assert!(!serde_json::to_string(&stored).unwrap().contains(&raw));
        }
    }

    #[test]
    fn test_authenticate_success_touches_usage() {
        let m = manager();
        let (raw, _) = m.generate(request("acme"));

        let identity = m.authenticate(&raw).unwrap();
        assert_eq!(identity.client_id, "acme");
        assert_eq!(identity.auth_type, "api_key");
        assert_eq!(identity.roles, vec!["reader"]);

        m.authenticate(&raw).unwrap();
        let key = m.store.get_by_hash(&hash_key(&raw)).unwrap();
        assert_eq!(key.usage_count, 2);
        assert!(key.last_used_at.is_some());
    }

    #[test]
    fn test_unknown_key_is_401() {
        let m = manager();
        let err = m.authenticate("rk_nope").unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_expired_key_is_401() {
        let m = manager();
        let mut req = request("acme");
        req.ttl = Some(Duration::from_millis(1));
        let (raw, _) = m.generate(req);

        std::thread::sleep(Duration::from_millis(5));
        let err = m.authenticate(&raw).unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_revoke_unrevoke_cycle() {
        let m = manager();
        let (raw, key) = m.generate(request("acme"));

        m.revoke(&key.key_prefix).unwrap();
        assert_eq!(m.authenticate(&raw).unwrap_err().status(), 403);

        m.unrevoke(&key.key_prefix).unwrap();
        let identity = m.authenticate(&raw).unwrap();
        assert_eq!(identity.client_id, "acme");
    }

    #[test]
    fn test_rotation_grace_window() {
        let m = manager();
        let (old_raw, old_key) = m.generate(request("acme"));

        let (new_raw, new_key) = m.rotate(&old_key.key_prefix, Duration::from_secs(3600)).unwrap();
        assert_eq!(new_key.client_id, "acme");
        assert_eq!(new_key.rotated_from.as_deref(), Some(old_key.key_hash.as_str()));

        // Both keys authenticate to the same identity during the grace.
        assert_eq!(m.authenticate(&old_raw).unwrap().client_id, "acme");
        assert_eq!(m.authenticate(&new_raw).unwrap().client_id, "acme");
    }

    #[test]
    fn test_rotation_deadline_expires_old_key() {
        let m = manager();
        let (old_raw, old_key) = m.generate(request("acme"));
        let (new_raw, _) = m.rotate(&old_key.key_prefix, Duration::from_millis(1)).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(m.authenticate(&old_raw).unwrap_err().status(), 401);
        assert!(m.authenticate(&new_raw).is_ok());
    }

    #[test]
    fn test_rotating_revoked_key_is_refused() {
        let m = manager();
        let (_, key) = m.generate(request("acme"));
        m.revoke(&key.key_prefix).unwrap();
        let err = m.rotate(&key.key_prefix, Duration::from_secs(60)).unwrap_err();
        assert_eq!(err.status(), 403);
    }

    #[test]
    fn test_rotated_key_inherits_expiry() {
        let m = manager();
        let mut req = request("acme");
        req.ttl = Some(Duration::from_secs(3600));
        let (_, old_key) = m.generate(req);

        let (_, new_key) = m.rotate(&old_key.key_prefix, Duration::from_secs(60)).unwrap();
        assert_eq!(new_key.expires_at, old_key.expires_at);
    }

    #[test]
    fn test_per_key_rate_limit_is_429() {
        let m = manager();
        let mut req = request("acme");
        req.rate_limit = Some(KeyRateLimit {
            rate: 2,
            period_secs: Some(60),
            burst: Some(2),
        });
        let (raw, _) = m.generate(req);

        assert!(m.authenticate(&raw).is_ok());
        assert!(m.authenticate(&raw).is_ok());
        match m.authenticate(&raw).unwrap_err() {
            AuthError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected 429, got {:?}", other),
        }
    }

    #[test]
    fn test_delete_evicts_limiter() {
        let m = manager();
        let mut req = request("acme");
        req.rate_limit = Some(KeyRateLimit {
            rate: 1,
            period_secs: None,
            burst: None,
        });
        let (raw, key) = m.generate(req);
        assert_eq!(m.limiters.len(), 1);

        m.delete(&key.key_prefix).unwrap();
        assert_eq!(m.limiters.len(), 0);
        assert_eq!(m.authenticate(&raw).unwrap_err().status(), 401);
    }

    #[test]
    fn test_sweeper_removes_only_dead_keys() {
        let m = manager();
        let mut short = request("short");
        short.ttl = Some(Duration::from_millis(1));
        let (_, _) = m.generate(short);
        let (live_raw, _) = m.generate(request("live"));

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(m.sweep_expired(), 1);
        assert_eq!(m.list().len(), 1);
        assert!(m.authenticate(&live_raw).is_ok());
    }

    #[test]
    fn test_register_raw_masks() {
        let m = manager();
        let key = m.register_raw("sk-test-123456789", request("acme"));
        assert_eq!(key.masked_key, "sk-t****6789");
        assert!(m.authenticate("sk-test-123456789").is_ok());
    }

    #[tokio::test]
    async fn test_sweeper_task_lifecycle() {
        let m = KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            16,
            Duration::from_millis(10),
        );
        let mut req = request("acme");
        req.ttl = Some(Duration::from_millis(1));
        m.generate(req);

        m.start_sweeper();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(m.list().is_empty());
        m.stop().await;
    }
}
