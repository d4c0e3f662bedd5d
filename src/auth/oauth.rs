use super::{jwt::bearer_token, AuthError, Identity};
use dashmap::DashMap;
use http::HeaderMap;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::warn;

/// Cache bound: when reached, the whole cache is dropped rather than evicted
/// entry-by-entry. Introspection results are cheap to refetch and the flat
/// clear keeps the hot path free of bookkeeping.
const CACHE_MAX_ENTRIES: usize = 10_000;

/// Cap on how long an introspection result may be reused, regardless of the
/// token's own expiry.
const CACHE_MAX_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub introspection_url: String,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

struct CachedIntrospection {
    identity: Identity,
    expires_at: Instant,
}

/// RFC 7662 token introspection with a bounded response cache.
pub struct OAuthIntrospector {
    config: OAuthConfig,
    http: reqwest::Client,
    cache: DashMap<String, CachedIntrospection>,
}

impl OAuthIntrospector {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            cache: DashMap::new(),
        }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer_token(headers)
            .ok_or_else(|| AuthError::InvalidCredentials("missing bearer token".into()))?
            .to_string();

        if let Some(entry) = self.cache.get(&token) {
            if entry.expires_at > Instant::now() {
                return Ok(entry.identity.clone());
            }
        }

        let response = self
            .http
            .post(&self.config.introspection_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[("token", token.as_str())])
            .send()
            .await
            .map_err(|e| AuthError::Internal(format!("introspection call failed: {}", e)))?;

        let introspection: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Internal(format!("bad introspection response: {}", e)))?;

        if !introspection.active {
            return Err(AuthError::InvalidCredentials("token not active".into()));
        }

        let client_id = introspection
            .sub
            .or(introspection.username)
            .unwrap_or_default();
        let mut identity = Identity::new(client_id, "oauth");
        if let Some(scope) = &introspection.scope {
            identity.roles = scope.split_whitespace().map(String::from).collect();
        }
        identity.claims = introspection.extra;

        let token_ttl = introspection
            .exp
            .map(|exp| exp - chrono::Utc::now().timestamp())
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(CACHE_MAX_TTL);

        if self.cache.len() >= CACHE_MAX_ENTRIES {
            warn!("oauth: introspection cache full, clearing");
            self.cache.clear();
        }
        self.cache.insert(
            token,
            CachedIntrospection {
                identity: identity.clone(),
                expires_at: Instant::now() + token_ttl.min(CACHE_MAX_TTL),
            },
        );
        Ok(identity)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    fn prime_cache(&self, token: &str, identity: Identity, ttl: Duration) {
        if self.cache.len() >= CACHE_MAX_ENTRIES {
            self.cache.clear();
        }
        self.cache.insert(
            token.to_string(),
            CachedIntrospection {
                identity,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
