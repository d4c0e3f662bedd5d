pub mod basic;
pub mod jwt;
pub mod keys;
pub mod ldap;
pub mod mtls;
pub mod oauth;
pub mod saml;

use serde::Serialize;
use serde_json::Value;

/// Authenticated caller identity, produced by any scheme and carried on the
/// request context for the rest of the pipeline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Identity {
    pub client_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub roles: Vec<String>,
    /// Scheme that produced this identity ("api_key", "saml", "jwt", ...).
    pub auth_type: &'static str,
    /// Untyped claims copied out of upstream tokens. Opaque key/value data;
    /// stringified on demand at key-extraction points.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty", default)]
    pub claims: serde_json::Map<String, Value>,
    /// Tenant-assigned admission priority; 0 means unset.
    #[serde(skip)]
    pub priority: u32,
}

impl Identity {
    pub fn new(client_id: impl Into<String>, auth_type: &'static str) -> Self {
        Self {
            client_id: client_id.into(),
            auth_type,
            ..Self::default()
        }
    }

    /// Stringify a claim value with the deterministic rule used by key
    /// extraction: strings pass through, numbers use their shortest decimal
    /// form, booleans render `true`/`false`.
    pub fn claim_as_string(&self, name: &str) -> Option<String> {
        claim_to_string(self.claims.get(name)?)
    }
}

pub fn claim_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        _ => None,
    }
}

/// Error taxonomy shared by every authentication scheme. The variant decides
/// the HTTP status the pipeline responds with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// 401 — credentials missing, unparsable, expired, or unknown.
    InvalidCredentials(String),
    /// 403 — credentials known but refused (revoked key, failed policy).
    Forbidden(String),
    /// 429 — per-credential rate limit; retry_after in seconds.
    RateLimited { retry_after_secs: u64 },
    /// 500-class — the scheme itself failed (upstream IdP unreachable, ...).
    Internal(String),
}

impl AuthError {
    pub fn status(&self) -> u16 {
        match self {
            AuthError::InvalidCredentials(_) => 401,
            AuthError::Forbidden(_) => 403,
            AuthError::RateLimited { .. } => 429,
            AuthError::Internal(_) => 500,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials(msg) => write!(f, "invalid credentials: {}", msg),
            AuthError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            AuthError::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {}s", retry_after_secs)
            }
            AuthError::Internal(msg) => write!(f, "auth internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}
