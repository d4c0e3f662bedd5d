use super::{AuthError, Identity};
use arc_swap::ArcSwap;
use http::HeaderMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Inline JWKS document; used as-is when set.
    pub jwks_json: Option<String>,
    /// Remote JWKS endpoint, re-fetched on `refresh_interval`.
    pub jwks_url: Option<String>,
    pub refresh_interval: Duration,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

struct CachedKey {
    kid: Option<String>,
    key: DecodingKey,
    algorithm: Algorithm,
}

/// Bearer-token authenticator over a cached JWKS.
///
/// Key selection is by `kid`; a token without one falls back to the sole
/// cached key when exactly one exists (single-key issuers routinely omit the
/// header).
pub struct JwtAuthenticator {
    keys: ArcSwap<Vec<CachedKey>>,
    issuer: Option<String>,
    audience: Option<String>,
    jwks_url: Option<String>,
    refresh_interval: Duration,
    http: reqwest::Client,
    shutdown: Notify,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl JwtAuthenticator {
    pub async fn new(config: JwtConfig) -> anyhow::Result<Arc<Self>> {
        let authenticator = Arc::new(Self {
            keys: ArcSwap::from_pointee(Vec::new()),
            issuer: config.issuer,
            audience: config.audience,
            jwks_url: config.jwks_url.clone(),
            refresh_interval: config.refresh_interval,
            http: reqwest::Client::new(),
            shutdown: Notify::new(),
            refresher: Mutex::new(None),
        });

        if let Some(json) = &config.jwks_json {
            authenticator.install_jwks(json)?;
        } else if let Some(url) = &config.jwks_url {
            let body = authenticator.http.get(url).send().await?.text().await?;
            authenticator.install_jwks(&body)?;
        } else {
            anyhow::bail!("jwt auth requires an inline JWKS or a JWKS url");
        }
        Ok(authenticator)
    }

    fn install_jwks(&self, json: &str) -> anyhow::Result<()> {
        let set: JwkSet = serde_json::from_str(json)?;
        let mut keys = Vec::with_capacity(set.keys.len());
        for jwk in &set.keys {
            let algorithm = match &jwk.algorithm {
                AlgorithmParameters::RSA(_) => Algorithm::RS256,
                AlgorithmParameters::EllipticCurve(_) => Algorithm::ES256,
                AlgorithmParameters::OctetKey(_) => Algorithm::HS256,
                _ => {
                    warn!("jwks: skipping key with unsupported algorithm family");
                    continue;
                }
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => keys.push(CachedKey {
                    kid: jwk.common.key_id.clone(),
                    key,
                    algorithm,
                }),
                Err(e) => warn!("jwks: skipping unusable key: {}", e),
            }
        }
        if keys.is_empty() {
            anyhow::bail!("JWKS contained no usable keys");
        }
        info!("jwks: loaded {} keys", keys.len());
        self.keys.store(Arc::new(keys));
        Ok(())
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        let token = bearer_token(headers)
            .ok_or_else(|| AuthError::InvalidCredentials("missing bearer token".into()))?;
        self.authenticate_token(token)
    }

    pub fn authenticate_token(&self, token: &str) -> Result<Identity, AuthError> {
        let header = decode_header(token)
            .map_err(|e| AuthError::InvalidCredentials(format!("bad token header: {}", e)))?;

        let keys = self.keys.load();
        let selected = match &header.kid {
            Some(kid) => keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            // No kid: unambiguous only with a single key.
            None if keys.len() == 1 => keys.first(),
            None => None,
        }
        .ok_or_else(|| AuthError::InvalidCredentials("no matching JWKS key".into()))?;

        let mut validation = Validation::new(selected.algorithm);
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &selected.key,
            &validation,
        )
        .map_err(|e| AuthError::InvalidCredentials(format!("invalid token: {}", e)))?;

        let claims = data.claims;
        let client_id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut identity = Identity::new(client_id, "jwt");
        identity.email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(String::from);
        if let Some(roles) = claims.get("roles").and_then(|v| v.as_array()) {
            identity.roles = roles
                .iter()
                .filter_map(|r| r.as_str().map(String::from))
                .collect();
        }
        identity.claims = claims;
        Ok(identity)
    }

    pub fn start_refresh(self: &Arc<Self>) {
        let Some(url) = self.jwks_url.clone() else {
            return;
        };
        let mut slot = self.refresher.lock().expect("jwks refresher lock poisoned");
        if slot.is_some() {
            return;
        }
        let authenticator = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(authenticator.refresh_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match authenticator.fetch_and_install(&url).await {
                            Ok(()) => {}
                            Err(e) => warn!("jwks: refresh failed, keeping cached keys: {}", e),
                        }
                    }
                    _ = authenticator.shutdown.notified() => return,
                }
            }
        }));
    }

    async fn fetch_and_install(&self, url: &str) -> anyhow::Result<()> {
        let body = self.http.get(url).send().await?.text().await?;
        self.install_jwks(&body)
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self
            .refresher
            .lock()
            .expect("jwks refresher lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn oct_jwks(kid: Option<&str>) -> String {
        let k = URL_SAFE_NO_PAD.encode(SECRET);
        match kid {
            Some(kid) => format!(
                r#"{{"keys":[{{"kty":"oct","kid":"{}","k":"{}"}}]}}"#,
                kid, k
            ),
            None => format!(r#"{{"keys":[{{"kty":"oct","k":"{}"}}]}}"#, k),
        }
    }

    fn sign(kid: Option<&str>, claims: &serde_json::Value) -> String {
        let mut header = Header::default();
        header.kid = kid.map(String::from);
        encode(&header, claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn claims() -> serde_json::Value {
        serde_json::json!({
            "sub": "client-7",
            "email": "c7@example.com",
            "roles": ["ops"],
            "plan": "gold",
            "exp": chrono::Utc::now().timestamp() + 600,
        })
    }

    #[tokio::test]
    async fn test_kid_selection() {
        let auth = JwtAuthenticator::new(JwtConfig {
            jwks_json: Some(oct_jwks(Some("key-1"))),
            jwks_url: None,
            refresh_interval: Duration::from_secs(600),
            issuer: None,
            audience: None,
        })
        .await
        .unwrap();

        let identity = auth
            .authenticate_token(&sign(Some("key-1"), &claims()))
            .unwrap();
        assert_eq!(identity.client_id, "client-7");
        assert_eq!(identity.email.as_deref(), Some("c7@example.com"));
        assert_eq!(identity.roles, vec!["ops"]);
        assert_eq!(identity.claim_as_string("plan").as_deref(), Some("gold"));
    }

    #[tokio::test]
    async fn test_missing_kid_falls_back_to_sole_key() {
        let auth = JwtAuthenticator::new(JwtConfig {
            jwks_json: Some(oct_jwks(Some("key-1"))),
            jwks_url: None,
            refresh_interval: Duration::from_secs(600),
            issuer: None,
            audience: None,
        })
        .await
        .unwrap();

        let identity = auth.authenticate_token(&sign(None, &claims())).unwrap();
        assert_eq!(identity.client_id, "client-7");
    }

    #[tokio::test]
    async fn test_unknown_kid_rejected() {
        let auth = JwtAuthenticator::new(JwtConfig {
            jwks_json: Some(oct_jwks(Some("key-1"))),
            jwks_url: None,
            refresh_interval: Duration::from_secs(600),
            issuer: None,
            audience: None,
        })
        .await
        .unwrap();

        let err = auth
            .authenticate_token(&sign(Some("other"), &claims()))
            .unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let auth = JwtAuthenticator::new(JwtConfig {
            jwks_json: Some(oct_jwks(None)),
            jwks_url: None,
            refresh_interval: Duration::from_secs(600),
            issuer: None,
            audience: None,
        })
        .await
        .unwrap();

        let expired = serde_json::json!({
            "sub": "x",
            "exp": chrono::Utc::now().timestamp() - 600,
        });
        assert!(auth.authenticate_token(&sign(None, &expired)).is_err());
    }

    #[tokio::test]
    async fn test_empty_jwks_fails_construction() {
        let result = JwtAuthenticator::new(JwtConfig {
            jwks_json: Some(r#"{"keys":[]}"#.into()),
            jwks_url: None,
            refresh_interval: Duration::from_secs(600),
            issuer: None,
            audience: None,
        })
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(
            http::header::AUTHORIZATION,
            "Bearer abc.def.ghi".parse().unwrap(),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }
}
