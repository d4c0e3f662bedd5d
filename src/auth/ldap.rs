use super::{AuthError, Identity};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One directory entry from a search.
#[derive(Debug, Clone, Default)]
pub struct LdapEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

/// The directory transport. The network LDAP client is an external
/// collaborator; the authenticator only needs bind and search.
#[async_trait]
pub trait Directory: Send {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> anyhow::Result<bool>;
    async fn search(&mut self, base: &str, filter: &str) -> anyhow::Result<Vec<LdapEntry>>;
}

#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    type Conn: Directory + Send + 'static;
    async fn connect(&self) -> anyhow::Result<Self::Conn>;
}

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub service_dn: String,
    pub service_password: String,
    pub user_base_dn: String,
    /// `{username}` is replaced with the (escaped) login name.
    pub user_filter: String,
    pub group_base_dn: Option<String>,
    /// `{dn}` / `{username}` are replaced before the group search.
    pub group_filter: Option<String>,
    pub pool_size: usize,
    pub conn_max_lifetime: Duration,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            service_dn: String::new(),
            service_password: String::new(),
            user_base_dn: String::new(),
            user_filter: "(uid={username})".into(),
            group_base_dn: None,
            group_filter: None,
            pool_size: 8,
            conn_max_lifetime: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(60),
            cache_max_entries: 1_000,
        }
    }
}

struct PooledConn<C> {
    conn: C,
    created: Instant,
}

struct CachedCred {
    identity: Identity,
    expires_at: Instant,
}

/// Directory-backed authenticator: service-bind → user-search → user-bind →
/// optional group-search, with a lifetime-bounded connection pool and a
/// TTL-bounded credential-hash cache in front of the directory.
pub struct LdapAuthenticator<C: DirectoryConnector> {
    connector: C,
    config: LdapConfig,
    pool: Mutex<VecDeque<PooledConn<C::Conn>>>,
    cache: Mutex<HashMap<String, CachedCred>>,
}

impl<C: DirectoryConnector> LdapAuthenticator<C> {
    pub fn new(connector: C, config: LdapConfig) -> Self {
        Self {
            connector,
            config,
            pool: Mutex::new(VecDeque::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let cred_hash = credential_hash(username, password);
        if let Some(identity) = self.cache_lookup(&cred_hash) {
            return Ok(identity);
        }

        let mut conn = self.checkout().await?;
        let result = self.bind_sequence(&mut conn, username, password).await;
        // Return the connection regardless of outcome; the next checkout
        // re-binds as the service account before reuse.
        self.check_in(conn);

        let identity = result?;
        self.cache_insert(cred_hash, identity.clone());
        Ok(identity)
    }

    async fn bind_sequence(
        &self,
        conn: &mut C::Conn,
        username: &str,
        password: &str,
    ) -> Result<Identity, AuthError> {
        let service_ok = conn
            .simple_bind(&self.config.service_dn, &self.config.service_password)
            .await
            .map_err(|e| AuthError::Internal(format!("service bind failed: {}", e)))?;
        if !service_ok {
            return Err(AuthError::Internal("service bind refused".into()));
        }

        let filter = self
            .config
            .user_filter
            .replace("{username}", &escape_filter(username));
        let entries = conn
            .search(&self.config.user_base_dn, &filter)
            .await
            .map_err(|e| AuthError::Internal(format!("user search failed: {}", e)))?;
        let user = entries
            .first()
            .ok_or_else(|| AuthError::InvalidCredentials("unknown user".into()))?
            .clone();

        let bound = conn
            .simple_bind(&user.dn, password)
            .await
            .map_err(|e| AuthError::Internal(format!("user bind failed: {}", e)))?;
        if !bound {
            return Err(AuthError::InvalidCredentials("bad credentials".into()));
        }

        let mut identity = Identity::new(username, "ldap");
        identity.display_name = user
            .attributes
            .get("cn")
            .and_then(|values| values.first().cloned());
        identity.email = user
            .attributes
            .get("mail")
            .and_then(|values| values.first().cloned());

        if let (Some(base), Some(filter)) = (&self.config.group_base_dn, &self.config.group_filter)
        {
            let filter = filter
                .replace("{dn}", &escape_filter(&user.dn))
                .replace("{username}", &escape_filter(username));
            let groups = conn
                .search(base, &filter)
                .await
                .map_err(|e| AuthError::Internal(format!("group search failed: {}", e)))?;
            identity.roles = groups
                .iter()
                .map(|g| {
                    g.attributes
                        .get("cn")
                        .and_then(|values| values.first().cloned())
                        .unwrap_or_else(|| g.dn.clone())
                })
                .collect();
        }
        Ok(identity)
    }

    async fn checkout(&self) -> Result<C::Conn, AuthError> {
        {
            let mut pool = self.pool.lock().expect("ldap pool lock poisoned");
            while let Some(pooled) = pool.pop_front() {
                if pooled.created.elapsed() < self.config.conn_max_lifetime {
                    return Ok(pooled.conn);
                }
                // Past its lifetime: drop and keep scanning.
            }
        }
        self.connector
            .connect()
            .await
            .map_err(|e| AuthError::Internal(format!("directory connect failed: {}", e)))
    }

    fn check_in(&self, conn: C::Conn) {
        let mut pool = self.pool.lock().expect("ldap pool lock poisoned");
        if pool.len() < self.config.pool_size {
            pool.push_back(PooledConn {
                conn,
                created: Instant::now(),
            });
        }
    }

    fn cache_lookup(&self, cred_hash: &str) -> Option<Identity> {
        let cache = self.cache.lock().expect("ldap cache lock poisoned");
        cache
            .get(cred_hash)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.identity.clone())
    }

    fn cache_insert(&self, cred_hash: String, identity: Identity) {
        let mut cache = self.cache.lock().expect("ldap cache lock poisoned");
        if cache.len() >= self.config.cache_max_entries {
            let now = Instant::now();
            cache.retain(|_, entry| entry.expires_at > now);
            if cache.len() >= self.config.cache_max_entries {
                cache.clear();
            }
        }
        cache.insert(
            cred_hash,
            CachedCred {
                identity,
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }

    pub fn pooled_connections(&self) -> usize {
        self.pool.lock().expect("ldap pool lock poisoned").len()
    }

    pub fn cached_credentials(&self) -> usize {
        self.cache.lock().expect("ldap cache lock poisoned").len()
    }
}

fn credential_hash(username: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// RFC 4515 escaping for values substituted into search filters.
fn escape_filter(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone)]
    struct MockDirectory {
        binds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Directory for MockDirectory {
        async fn simple_bind(&mut self, dn: &str, password: &str) -> anyhow::Result<bool> {
            self.binds.fetch_add(1, Ordering::Relaxed);
            Ok(matches!(
                (dn, password),
                ("cn=service,dc=example", "svc-pass")
                    | ("uid=alice,ou=people,dc=example", "alice-pass")
            ))
        }

        async fn search(&mut self, base: &str, filter: &str) -> anyhow::Result<Vec<LdapEntry>> {
            if base == "ou=people,dc=example" && filter.contains("alice") {
                return Ok(vec![LdapEntry {
                    dn: "uid=alice,ou=people,dc=example".into(),
                    attributes: HashMap::from([
                        ("cn".to_string(), vec!["Alice A".to_string()]),
                        ("mail".to_string(), vec!["alice@example.com".to_string()]),
                    ]),
                }]);
            }
            if base == "ou=groups,dc=example" {
                return Ok(vec![LdapEntry {
                    dn: "cn=ops,ou=groups,dc=example".into(),
                    attributes: HashMap::from([("cn".to_string(), vec!["ops".to_string()])]),
                }]);
            }
            Ok(Vec::new())
        }
    }

    struct MockConnector {
        binds: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DirectoryConnector for MockConnector {
        type Conn = MockDirectory;
        async fn connect(&self) -> anyhow::Result<MockDirectory> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            Ok(MockDirectory {
                binds: self.binds.clone(),
            })
        }
    }

    fn authenticator() -> (LdapAuthenticator<MockConnector>, Arc<AtomicUsize>) {
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = MockConnector {
            binds: Arc::new(AtomicUsize::new(0)),
            connects: connects.clone(),
        };
        let config = LdapConfig {
            service_dn: "cn=service,dc=example".into(),
            service_password: "svc-pass".into(),
            user_base_dn: "ou=people,dc=example".into(),
            group_base_dn: Some("ou=groups,dc=example".into()),
            group_filter: Some("(member={dn})".into()),
            ..LdapConfig::default()
        };
        (LdapAuthenticator::new(connector, config), connects)
    }

    #[tokio::test]
    async fn test_full_bind_sequence() {
        let (auth, _) = authenticator();
        let identity = auth.authenticate("alice", "alice-pass").await.unwrap();
        assert_eq!(identity.client_id, "alice");
        assert_eq!(identity.auth_type, "ldap");
        assert_eq!(identity.display_name.as_deref(), Some("Alice A"));
        assert_eq!(identity.email.as_deref(), Some("alice@example.com"));
        assert_eq!(identity.roles, vec!["ops"]);
    }

    #[tokio::test]
    async fn test_wrong_password_is_401() {
        let (auth, _) = authenticator();
        let err = auth.authenticate("alice", "nope").await.unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn test_unknown_user_is_401() {
        let (auth, _) = authenticator();
        let err = auth.authenticate("mallory", "x").await.unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn test_credential_cache_skips_directory() {
        let (auth, connects) = authenticator();
        auth.authenticate("alice", "alice-pass").await.unwrap();
        let connects_after_first = connects.load(Ordering::Relaxed);

        auth.authenticate("alice", "alice-pass").await.unwrap();
        assert_eq!(connects.load(Ordering::Relaxed), connects_after_first);
        assert_eq!(auth.cached_credentials(), 1);
    }

    #[tokio::test]
    async fn test_connection_reuse_through_pool() {
        let (auth, connects) = authenticator();
        auth.authenticate("alice", "alice-pass").await.unwrap();
        assert_eq!(auth.pooled_connections(), 1);

        // Different password misses the cache but reuses the pooled conn.
        let _ = auth.authenticate("alice", "wrong").await;
        assert_eq!(connects.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_filter_escaping() {
        assert_eq!(escape_filter("a*b(c)d\\e"), "a\\2ab\\28c\\29d\\5ce");
    }

    #[test]
    fn test_credential_hash_differs_by_both_parts() {
        assert_ne!(credential_hash("a", "b"), credential_hash("a", "c"));
        assert_ne!(credential_hash("a", "b"), credential_hash("b", "a"));
        // The separator keeps "ab"+"c" distinct from "a"+"bc".
        assert_ne!(credential_hash("ab", "c"), credential_hash("a", "bc"));
    }
}
