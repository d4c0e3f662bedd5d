use super::key::KeyStrategy;
use super::token_bucket::TokenBucketLimiter;
use super::Decision;
use crate::auth::Identity;
use http::HeaderMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// Where the tier name comes from.
#[derive(Debug, Clone)]
pub enum TierSource {
    Header(String),
    Claim(String),
}

/// Tiered rate limiter: a named token bucket per service tier.
///
/// The tier is resolved from the request (header or identity claim), unless
/// an upstream pipeline stage already decided it (`override_tier`). The
/// per-client key is computed within the tier so two tenants on the same
/// tier do not share a bucket.
pub struct TieredLimiter {
    tiers: HashMap<String, TokenBucketLimiter>,
    default_tier: Option<String>,
    source: TierSource,
    key_strategy: KeyStrategy,
}

/// Outcome of a tiered admission check. `PassThrough` means no tier matched
/// and no default is configured — the request is not limited here.
pub enum TieredDecision {
    Limited { tier: String, decision: Decision },
    PassThrough,
}

impl TieredLimiter {
    pub fn new(source: TierSource, key_strategy: KeyStrategy, default_tier: Option<String>) -> Self {
        Self {
            tiers: HashMap::new(),
            default_tier,
            source,
            key_strategy,
        }
    }

    pub fn add_tier(&mut self, name: impl Into<String>, rate: u64, period: Option<Duration>, burst: Option<u64>) {
        self.tiers
            .insert(name.into(), TokenBucketLimiter::new(rate, period, burst));
    }

    fn resolve_tier(
        &self,
        headers: &HeaderMap,
        identity: Option<&Identity>,
        override_tier: Option<&str>,
    ) -> Option<&str> {
        // A tier decided upstream in the pipeline wins over extraction.
        if let Some(name) = override_tier {
            if let Some((key, _)) = self.tiers.get_key_value(name) {
                return Some(key.as_str());
            }
        }

        let extracted = match &self.source {
            TierSource::Header(name) => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
            TierSource::Claim(name) => identity.and_then(|id| id.claim_as_string(name)),
        };

        if let Some(name) = extracted {
            if let Some((key, _)) = self.tiers.get_key_value(name.as_str()) {
                return Some(key.as_str());
            }
        }
        self.default_tier.as_deref().filter(|d| self.tiers.contains_key(*d))
    }

    pub fn allow(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
        identity: Option<&Identity>,
        override_tier: Option<&str>,
    ) -> TieredDecision {
        let Some(tier) = self.resolve_tier(headers, identity, override_tier) else {
            return TieredDecision::PassThrough;
        };
        let limiter = &self.tiers[tier];
        let key = self.key_strategy.extract(headers, client_ip, identity);
        TieredDecision::Limited {
            tier: tier.to_string(),
            decision: limiter.allow(&key),
        }
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.keys().map(|k| k.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn limiter() -> TieredLimiter {
        let mut l = TieredLimiter::new(
            TierSource::Header("X-Tier".into()),
            KeyStrategy::ClientId,
            Some("free".into()),
        );
        l.add_tier("free", 2, None, None);
        l.add_tier("gold", 100, None, None);
        l
    }

    #[test]
    fn test_tier_from_header() {
        let l = limiter();
        let mut headers = HeaderMap::new();
        headers.insert("x-tier", HeaderValue::from_static("gold"));

        match l.allow(&headers, ip(), None, None) {
            TieredDecision::Limited { tier, decision } => {
                assert_eq!(tier, "gold");
                assert!(decision.allowed);
                assert_eq!(decision.limit, 100);
            }
            TieredDecision::PassThrough => panic!("expected a limited decision"),
        }
    }

    #[test]
    fn test_unknown_tier_uses_default() {
        let l = limiter();
        let mut headers = HeaderMap::new();
        headers.insert("x-tier", HeaderValue::from_static("platinum"));

        match l.allow(&headers, ip(), None, None) {
            TieredDecision::Limited { tier, .. } => assert_eq!(tier, "free"),
            TieredDecision::PassThrough => panic!("expected default tier"),
        }
    }

    #[test]
    fn test_no_default_passes_through() {
        let mut l = TieredLimiter::new(
            TierSource::Header("X-Tier".into()),
            KeyStrategy::Ip,
            None,
        );
        l.add_tier("gold", 10, None, None);

        let headers = HeaderMap::new();
        assert!(matches!(
            l.allow(&headers, ip(), None, None),
            TieredDecision::PassThrough
        ));
    }

    #[test]
    fn test_override_wins_over_header() {
        let l = limiter();
        let mut headers = HeaderMap::new();
        headers.insert("x-tier", HeaderValue::from_static("free"));

        match l.allow(&headers, ip(), None, Some("gold")) {
            TieredDecision::Limited { tier, .. } => assert_eq!(tier, "gold"),
            TieredDecision::PassThrough => panic!("expected override tier"),
        }
    }

    #[test]
    fn test_tier_from_claim() {
        let mut l = TieredLimiter::new(
            TierSource::Claim("plan".into()),
            KeyStrategy::ClientId,
            None,
        );
        l.add_tier("pro", 10, None, None);

        let mut identity = Identity::new("c1", "jwt");
        identity.claims.insert("plan".into(), json!("pro"));

        match l.allow(&HeaderMap::new(), ip(), Some(&identity), None) {
            TieredDecision::Limited { tier, .. } => assert_eq!(tier, "pro"),
            TieredDecision::PassThrough => panic!("expected claim tier"),
        }
    }

    #[test]
    fn test_clients_in_tier_are_isolated() {
        let mut l = TieredLimiter::new(
            TierSource::Header("X-Tier".into()),
            KeyStrategy::ClientId,
            None,
        );
        l.add_tier("free", 1, None, None);

        let mut headers = HeaderMap::new();
        headers.insert("x-tier", HeaderValue::from_static("free"));
        let a = Identity::new("a", "api_key");
        let b = Identity::new("b", "api_key");

        match l.allow(&headers, ip(), Some(&a), None) {
            TieredDecision::Limited { decision, .. } => assert!(decision.allowed),
            _ => panic!(),
        }
        match l.allow(&headers, ip(), Some(&a), None) {
            TieredDecision::Limited { decision, .. } => assert!(!decision.allowed),
            _ => panic!(),
        }
        // A different client in the same tier still has its full budget.
        match l.allow(&headers, ip(), Some(&b), None) {
            TieredDecision::Limited { decision, .. } => assert!(decision.allowed),
            _ => panic!(),
        }
    }
}
