pub mod assertion;
pub mod replay;

use super::{AuthError, Identity};
use arc_swap::ArcSwap;
use assertion::{parse_assertion, parse_idp_metadata, parse_logout_request, IdpMetadata};
use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use http::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use replay::ReplayCache;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Stateless assertion transport header.
pub const ASSERTION_HEADER: &str = "x-saml-assertion";

/// Maps IdP attribute names onto identity fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeMapping {
    pub client_id: String,
    pub email: String,
    pub display_name: String,
    pub roles: String,
}

impl Default for AttributeMapping {
    fn default() -> Self {
        Self {
            client_id: "uid".into(),
            email: "email".into(),
            display_name: "displayName".into(),
            roles: "groups".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SamlConfig {
    pub sp_entity_id: String,
    /// Externally reachable base URL of this gateway, e.g.
    /// `https://gw.example.com`. Endpoint paths are appended to it.
    pub sp_base_url: String,
    pub path_prefix: String,
    /// Static IdP endpoints; superseded by fetched metadata when
    /// `idp_metadata_url` is set.
    pub idp_sso_url: String,
    pub idp_slo_url: Option<String>,
    pub idp_metadata_url: Option<String>,
    pub metadata_refresh_interval: Duration,
    /// HMAC key for relay-state signing and the HS256 session token.
    pub signing_key: Vec<u8>,
    pub session_cookie: String,
    pub session_max_age: Duration,
    pub clock_skew: Duration,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
    pub attribute_mapping: AttributeMapping,
}

impl Default for SamlConfig {
    fn default() -> Self {
        Self {
            sp_entity_id: "runway-gateway".into(),
            sp_base_url: "http://localhost:8080".into(),
            path_prefix: "/saml/".into(),
            idp_sso_url: String::new(),
            idp_slo_url: None,
            idp_metadata_url: None,
            metadata_refresh_interval: Duration::from_secs(24 * 3600),
            signing_key: Vec::new(),
            session_cookie: "runway_session".into(),
            session_max_age: Duration::from_secs(8 * 3600),
            clock_skew: Duration::from_secs(90),
            cookie_secure: true,
            cookie_same_site: SameSite::Lax,
            attribute_mapping: AttributeMapping::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SamlStats {
    pub sso_attempts: AtomicU64,
    pub sso_successes: AtomicU64,
    pub sso_failures: AtomicU64,
    pub token_validations: AtomicU64,
    pub token_validation_successes: AtomicU64,
    pub token_validation_failures: AtomicU64,
    pub session_auths: AtomicU64,
    pub logout_requests: AtomicU64,
}

/// Session token claims minted at the ACS.
#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    sub: String,
    auth_type: String,
    iat: i64,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    roles: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    claims: serde_json::Map<String, serde_json::Value>,
}

/// SAML service provider: stateless header authentication, browser SSO
/// (login → ACS → session cookie → SLO), replay protection, and periodic
/// IdP metadata refresh.
pub struct SamlProvider {
    config: SamlConfig,
    replay: ReplayCache,
    idp: ArcSwap<IdpMetadata>,
    pub stats: SamlStats,
    http: reqwest::Client,
    shutdown: Notify,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

/// What an SSO endpoint handler should do next.
#[derive(Debug)]
pub struct BrowserRedirect {
    pub location: String,
    /// Set-Cookie value to attach, when a session was minted or cleared.
    pub set_cookie: Option<String>,
}

impl SamlProvider {
    pub fn new(config: SamlConfig) -> anyhow::Result<Arc<Self>> {
        if config.signing_key.len() < 32 {
            anyhow::bail!("saml signing key must be at least 32 bytes");
        }
        let idp = IdpMetadata {
            entity_id: String::new(),
            sso_url: (!config.idp_sso_url.is_empty()).then(|| config.idp_sso_url.clone()),
            slo_url: config.idp_slo_url.clone(),
        };
        Ok(Arc::new(Self {
            config,
            replay: ReplayCache::new(),
            idp: ArcSwap::from_pointee(idp),
            stats: SamlStats::default(),
            http: reqwest::Client::new(),
            shutdown: Notify::new(),
            refresher: Mutex::new(None),
        }))
    }

    pub fn path_prefix(&self) -> &str {
        &self.config.path_prefix
    }

    pub fn session_cookie_name(&self) -> &str {
        &self.config.session_cookie
    }

    // -- request authentication ------------------------------------------------

    /// Authenticate a request: header mode when `X-SAML-Assertion` is
    /// present, otherwise session-cookie mode.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, AuthError> {
        if let Some(header) = headers.get(ASSERTION_HEADER) {
            let raw = header
                .to_str()
                .map_err(|_| AuthError::InvalidCredentials("bad assertion header".into()))?;
            return self.authenticate_assertion(raw);
        }

        if let Some(token) = crate::limiter::key::cookie_value(headers, &self.config.session_cookie)
        {
            self.stats.session_auths.fetch_add(1, Ordering::Relaxed);
            return self.verify_session_token(&token);
        }

        Err(AuthError::InvalidCredentials("no SAML credentials".into()))
    }

    fn authenticate_assertion(&self, encoded: &str) -> Result<Identity, AuthError> {
        self.stats.token_validations.fetch_add(1, Ordering::Relaxed);
        let result = self.validate_assertion_bytes(encoded);
        match &result {
            Ok(_) => {
                self.stats
                    .token_validation_successes
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats
                    .token_validation_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn validate_assertion_bytes(&self, encoded: &str) -> Result<Identity, AuthError> {
        let xml = BASE64
            .decode(encoded.trim())
            .map_err(|_| AuthError::InvalidCredentials("assertion is not base64".into()))?;
        let assertion = parse_assertion(&xml)
            .map_err(|e| AuthError::InvalidCredentials(format!("bad assertion: {}", e)))?;

        let now = Utc::now();
        let skew = ChronoDuration::from_std(self.config.clock_skew)
            .unwrap_or_else(|_| ChronoDuration::seconds(90));
        if let Some(not_before) = assertion.not_before {
            if now + skew < not_before {
                return Err(AuthError::InvalidCredentials(
                    "assertion not yet valid".into(),
                ));
            }
        }
        if let Some(not_on_or_after) = assertion.not_on_or_after {
            if now - skew >= not_on_or_after {
                return Err(AuthError::InvalidCredentials("assertion expired".into()));
            }
        }

        if !self
            .replay
            .check_and_insert(&assertion.id, self.config.session_max_age)
        {
            return Err(AuthError::InvalidCredentials(
                "assertion replayed".into(),
            ));
        }

        Ok(self.identity_from_assertion(&assertion))
    }

    fn identity_from_assertion(&self, assertion: &assertion::Assertion) -> Identity {
        let mapping = &self.config.attribute_mapping;
        let first = |name: &str| -> Option<String> {
            assertion
                .attributes
                .get(name)
                .and_then(|values| values.first().cloned())
        };

        let client_id = first(&mapping.client_id)
            .or_else(|| assertion.name_id.clone())
            .unwrap_or_default();
        let mut identity = Identity::new(client_id, "saml");
        identity.email = first(&mapping.email);
        identity.display_name = first(&mapping.display_name);
        identity.roles = assertion
            .attributes
            .get(&mapping.roles)
            .cloned()
            .unwrap_or_default();

        for (name, values) in &assertion.attributes {
            let value = if values.len() == 1 {
                serde_json::Value::String(values[0].clone())
            } else {
                serde_json::Value::Array(
                    values
                        .iter()
                        .map(|v| serde_json::Value::String(v.clone()))
                        .collect(),
                )
            };
            identity.claims.insert(name.clone(), value);
        }
        identity
    }

    // -- session tokens --------------------------------------------------------

    fn mint_session_token(&self, identity: &Identity) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = SessionClaims {
            sub: identity.client_id.clone(),
            auth_type: "saml".into(),
            iat: now.timestamp(),
            exp: (now
                + ChronoDuration::from_std(self.config.session_max_age)
                    .unwrap_or_else(|_| ChronoDuration::hours(8)))
            .timestamp(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            roles: identity.roles.clone(),
            claims: identity.claims.clone(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(&self.config.signing_key),
        )
        .map_err(|e| AuthError::Internal(format!("session token mint failed: {}", e)))
    }

    fn verify_session_token(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(&self.config.signing_key),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidCredentials("invalid session".into()))?;

        let claims = data.claims;
        let mut identity = Identity::new(claims.sub, "saml");
        identity.email = claims.email;
        identity.display_name = claims.display_name;
        identity.roles = claims.roles;
        identity.claims = claims.claims;
        Ok(identity)
    }

    fn session_cookie(&self, token: &str) -> String {
        Cookie::build((self.config.session_cookie.clone(), token.to_string()))
            .path("/")
            .http_only(true)
            .secure(self.config.cookie_secure)
            .same_site(self.config.cookie_same_site)
            .max_age(cookie::time::Duration::seconds(
                self.config.session_max_age.as_secs() as i64,
            ))
            .build()
            .to_string()
    }

    fn clear_session_cookie(&self) -> String {
        Cookie::build((self.config.session_cookie.clone(), String::new()))
            .path("/")
            .http_only(true)
            .secure(self.config.cookie_secure)
            .same_site(self.config.cookie_same_site)
            .max_age(cookie::time::Duration::ZERO)
            .build()
            .to_string()
    }

    // -- relay state -----------------------------------------------------------

    fn sign_relay_state(&self, return_to: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.config.signing_key).expect("hmac accepts any key len");
        mac.update(return_to.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        BASE64_URL.encode(format!("{}|{}", return_to, sig))
    }

    fn verify_relay_state(&self, relay: &str) -> Option<String> {
        let decoded = BASE64_URL.decode(relay).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (return_to, sig_hex) = decoded.rsplit_once('|')?;
        let mut mac =
            HmacSha256::new_from_slice(&self.config.signing_key).expect("hmac accepts any key len");
        mac.update(return_to.as_bytes());
        mac.verify_slice(&hex::decode(sig_hex).ok()?).ok()?;
        is_safe_return_to(return_to).then(|| return_to.to_string())
    }

    // -- browser endpoints -----------------------------------------------------

    /// `GET <prefix>login?return_to=...` — 302 to the IdP with a signed
    /// relay state. Only strictly relative `return_to` paths are accepted.
    pub fn start_login(&self, return_to: Option<&str>) -> Result<BrowserRedirect, AuthError> {
        self.stats.sso_attempts.fetch_add(1, Ordering::Relaxed);
        let return_to = match return_to {
            Some(rt) if is_safe_return_to(rt) => rt,
            Some(_) => {
                self.stats.sso_failures.fetch_add(1, Ordering::Relaxed);
                return Err(AuthError::InvalidCredentials(
                    "return_to must be a relative path".into(),
                ));
            }
            None => "/",
        };

        let idp = self.idp.load();
        let Some(sso_url) = idp.sso_url.clone() else {
            self.stats.sso_failures.fetch_add(1, Ordering::Relaxed);
            return Err(AuthError::Internal("no IdP SSO endpoint".into()));
        };

        let request = self.authn_request_xml();
        let location = format!(
            "{}{}SAMLRequest={}&RelayState={}",
            sso_url,
            if sso_url.contains('?') { "&" } else { "?" },
            percent_encode(&BASE64.encode(request)),
            percent_encode(&self.sign_relay_state(return_to)),
        );
        Ok(BrowserRedirect {
            location,
            set_cookie: None,
        })
    }

    fn authn_request_xml(&self) -> String {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        format!(
            r#"<samlp:AuthnRequest xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_{}" Version="2.0" IssueInstant="{}" AssertionConsumerServiceURL="{}"><saml:Issuer>{}</saml:Issuer></samlp:AuthnRequest>"#,
            hex::encode(id_bytes),
            Utc::now().to_rfc3339(),
            self.acs_url(),
            self.config.sp_entity_id,
        )
    }

    fn acs_url(&self) -> String {
        format!(
            "{}{}acs",
            self.config.sp_base_url.trim_end_matches('/'),
            self.config.path_prefix
        )
    }

    /// `POST <prefix>acs` — consume the IdP response, mint the session, and
    /// bounce the browser to the relay-state target.
    pub fn consume_acs(&self, form_body: &[u8]) -> Result<BrowserRedirect, AuthError> {
        self.stats.sso_attempts.fetch_add(1, Ordering::Relaxed);
        let result = self.consume_acs_inner(form_body);
        match &result {
            Ok(_) => {
                self.stats.sso_successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.sso_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    fn consume_acs_inner(&self, form_body: &[u8]) -> Result<BrowserRedirect, AuthError> {
        let form = parse_form(form_body);
        let response = form
            .iter()
            .find(|(k, _)| k == "SAMLResponse")
            .map(|(_, v)| v.as_str())
            .ok_or_else(|| AuthError::InvalidCredentials("missing SAMLResponse".into()))?;

        let identity = self.validate_assertion_bytes(response)?;
        let token = self.mint_session_token(&identity)?;

        let return_to = form
            .iter()
            .find(|(k, _)| k == "RelayState")
            .and_then(|(_, v)| self.verify_relay_state(v))
            .unwrap_or_else(|| "/".to_string());

        Ok(BrowserRedirect {
            location: return_to,
            set_cookie: Some(self.session_cookie(&token)),
        })
    }

    /// `GET|POST <prefix>slo` — SP-initiated logout clears the session and
    /// redirects to the IdP; an inbound IdP `SAMLRequest` gets a
    /// LogoutResponse redirect instead.
    pub fn logout(&self, saml_request: Option<&str>) -> Result<BrowserRedirect, AuthError> {
        self.stats.logout_requests.fetch_add(1, Ordering::Relaxed);
        let idp = self.idp.load();

        if let Some(encoded) = saml_request {
            let xml = BASE64
                .decode(encoded.trim())
                .map_err(|_| AuthError::InvalidCredentials("bad SAMLRequest".into()))?;
            let request = parse_logout_request(&xml)
                .map_err(|e| AuthError::InvalidCredentials(format!("bad logout request: {}", e)))?;

            let response = format!(
                r#"<samlp:LogoutResponse xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_{}" Version="2.0" InResponseTo="{}" IssueInstant="{}"><samlp:Status><samlp:StatusCode Value="urn:oasis:names:tc:SAML:2.0:status:Success"/></samlp:Status></samlp:LogoutResponse>"#,
                hex::encode(rand::random::<[u8; 16]>()),
                request.id,
                Utc::now().to_rfc3339(),
            );
            let base = idp.slo_url.clone().unwrap_or_else(|| "/".to_string());
            let location = format!(
                "{}{}SAMLResponse={}",
                base,
                if base.contains('?') { "&" } else { "?" },
                percent_encode(&BASE64.encode(response)),
            );
            return Ok(BrowserRedirect {
                location,
                set_cookie: Some(self.clear_session_cookie()),
            });
        }

        let location = idp.slo_url.clone().unwrap_or_else(|| "/".to_string());
        Ok(BrowserRedirect {
            location,
            set_cookie: Some(self.clear_session_cookie()),
        })
    }

    /// `GET <prefix>metadata` — SP metadata document.
    pub fn sp_metadata_xml(&self) -> String {
        format!(
            r#"<?xml version="1.0"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{}" index="0"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#,
            self.config.sp_entity_id,
            self.acs_url(),
        )
    }

    // -- metadata refresh ------------------------------------------------------

    pub fn start_metadata_refresh(self: &Arc<Self>) {
        let Some(url) = self.config.idp_metadata_url.clone() else {
            return;
        };
        let mut slot = self.refresher.lock().expect("refresher lock poisoned");
        if slot.is_some() {
            return;
        }
        let provider = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(provider.config.metadata_refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match provider.refresh_metadata(&url).await {
                            Ok(()) => info!("saml: IdP metadata refreshed from {}", url),
                            Err(e) => warn!("saml: metadata refresh failed: {}", e),
                        }
                    }
                    _ = provider.shutdown.notified() => return,
                }
            }
        }));
    }

    async fn refresh_metadata(&self, url: &str) -> anyhow::Result<()> {
        let body = self.http.get(url).send().await?.bytes().await?;
        let metadata = parse_idp_metadata(&body)?;
        self.idp.store(Arc::new(metadata));
        Ok(())
    }

    pub async fn stop(&self) {
        self.shutdown.notify_waiters();
        let handle = self.refresher.lock().expect("refresher lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// A safe post-login target is a strictly relative path: it must start with
/// a single `/` and carry no scheme or authority of its own.
fn is_safe_return_to(s: &str) -> bool {
    s.starts_with('/') && !s.starts_with("//") && !s.contains("://") && !s.contains('\\')
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}
