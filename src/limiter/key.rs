use crate::auth::Identity;
use cookie::Cookie;
use http::header::COOKIE;
use http::HeaderMap;
use std::net::IpAddr;

/// How the per-client rate-limit key is derived from a request.
///
/// Every strategy falls back to the client IP when its source is absent, so
/// unauthenticated or malformed requests still land in a bounded key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    Ip,
    ClientId,
    Header(String),
    Cookie(String),
    JwtClaim(String),
}

impl KeyStrategy {
    /// Parse the config form: `ip | client_id | header:<name> |
    /// cookie:<name> | jwt_claim:<name>`. Unknown strategies degrade to IP.
    pub fn parse(spec: &str) -> Self {
        if let Some(name) = spec.strip_prefix("header:") {
            return KeyStrategy::Header(name.to_string());
        }
        if let Some(name) = spec.strip_prefix("cookie:") {
            return KeyStrategy::Cookie(name.to_string());
        }
        if let Some(name) = spec.strip_prefix("jwt_claim:") {
            return KeyStrategy::JwtClaim(name.to_string());
        }
        match spec {
            "client_id" => KeyStrategy::ClientId,
            _ => KeyStrategy::Ip,
        }
    }

    pub fn extract(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
        identity: Option<&Identity>,
    ) -> String {
        match self {
            KeyStrategy::Ip => client_ip.to_string(),
            KeyStrategy::ClientId => identity
                .filter(|id| !id.client_id.is_empty())
                .map(|id| id.client_id.clone())
                .unwrap_or_else(|| client_ip.to_string()),
            KeyStrategy::Header(name) => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
                .unwrap_or_else(|| client_ip.to_string()),
            KeyStrategy::Cookie(name) => cookie_value(headers, name)
                .unwrap_or_else(|| client_ip.to_string()),
            KeyStrategy::JwtClaim(name) => identity
                .and_then(|id| id.claim_as_string(name))
                .unwrap_or_else(|| client_ip.to_string()),
        }
    }
}

pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let raw = header.to_str().ok()?;
        for cookie in Cookie::split_parse(raw).flatten() {
            if cookie.name() == name {
                return Some(cookie.value().to_string());
            }
        }
    }
    None
}
