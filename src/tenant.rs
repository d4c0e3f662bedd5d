use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Header a client uses to name its tenant, and the one stamped on
/// responses.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Prefix for tenant metadata propagated onto responses.
const TENANT_META_PREFIX: &str = "x-tenant-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    /// Host names that map to this tenant when no header is present.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Admission priority for the priority admitter; 0 = unset.
    #[serde(default)]
    pub priority: u32,
    /// Tier override fed to the tiered limiter.
    #[serde(default)]
    pub tier: Option<String>,
    /// Propagated to clients as `X-Tenant-<key>` response headers.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Outcome of tenant resolution.
pub enum TenantMatch {
    Tenant(Arc<TenantConfig>),
    /// A tenant header was presented but names no known tenant → 403.
    Unknown,
    /// No tenant identification at all.
    None,
}

/// Resolves the tenant for a request: explicit `X-Tenant-ID` header first,
/// then the request host.
pub struct TenantResolver {
    by_id: HashMap<String, Arc<TenantConfig>>,
    by_host: HashMap<String, Arc<TenantConfig>>,
}

impl TenantResolver {
    pub fn new(tenants: Vec<TenantConfig>) -> Self {
        let mut by_id = HashMap::new();
        let mut by_host = HashMap::new();
        for tenant in tenants {
            let tenant = Arc::new(tenant);
            for host in &tenant.hosts {
                by_host.insert(host.to_ascii_lowercase(), tenant.clone());
            }
            by_id.insert(tenant.id.clone(), tenant);
        }
        Self { by_id, by_host }
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn resolve(&self, headers: &HeaderMap, host: &str) -> TenantMatch {
        if let Some(id) = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok()) {
            return match self.by_id.get(id) {
                Some(tenant) => TenantMatch::Tenant(tenant.clone()),
                None => TenantMatch::Unknown,
            };
        }

        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        match self.by_host.get(&host) {
            Some(tenant) => TenantMatch::Tenant(tenant.clone()),
            None => TenantMatch::None,
        }
    }
}

/// Stamp tenant identification and metadata onto a response.
pub fn apply_tenant_headers(tenant: &TenantConfig, headers: &mut HeaderMap) {
    if let Ok(value) = HeaderValue::from_str(&tenant.id) {
        headers.insert(HeaderName::from_static(TENANT_HEADER), value);
    }
    for (key, value) in &tenant.metadata {
        let name = format!("{}{}", TENANT_META_PREFIX, key.to_ascii_lowercase());
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
}
