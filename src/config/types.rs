use crate::auth::saml::AttributeMapping;
use crate::composer::StepConfig;
use crate::tenant::TenantConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Deserialize a `T` that implements `Default` — treats `null` the same as
/// a missing field. Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tenants: Vec<TenantConfig>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

/// Service-wide (pre-route) features.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub rate_limit: Option<ServiceRateLimitConfig>,

    #[serde(default)]
    pub bot: Option<BotConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRateLimitConfig {
    /// "local" (in-process sliding window) or "redis" (distributed).
    #[serde(default = "default_service_rl_mode")]
    pub mode: String,

    pub rate: u64,

    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    #[serde(default)]
    pub burst: Option<u64>,

    /// Key strategy: `ip | client_id | header:<name> | cookie:<name> |
    /// jwt_claim:<name>`.
    #[serde(default = "default_key_strategy")]
    pub key: String,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_redis_prefix")]
    pub redis_key_prefix: String,
}

fn default_service_rl_mode() -> String {
    "local".to_string()
}

fn default_period_secs() -> u64 {
    60
}

fn default_key_strategy() -> String {
    "ip".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_prefix() -> String {
    "runway:rl:".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub deny: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_keys: Option<ApiKeyConfig>,

    #[serde(default)]
    pub saml: Option<SamlFileConfig>,

    #[serde(default)]
    pub jwt: Option<JwtFileConfig>,

    #[serde(default)]
    pub oauth: Option<OAuthFileConfig>,

    /// username → password table for Basic auth.
    #[serde(default)]
    pub basic_users: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default = "default_key_length")]
    pub key_length: usize,

    #[serde(default = "default_cleanup_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for ApiKeyConfig {
    fn default() -> Self {
        Self {
            key_length: default_key_length(),
            cleanup_interval_secs: default_cleanup_secs(),
        }
    }
}

fn default_key_length() -> usize {
    32
}

fn default_cleanup_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamlFileConfig {
    pub sp_entity_id: String,

    pub sp_base_url: String,

    #[serde(default = "default_saml_prefix")]
    pub path_prefix: String,

    #[serde(default)]
    pub idp_sso_url: String,

    #[serde(default)]
    pub idp_slo_url: Option<String>,

    #[serde(default)]
    pub idp_metadata_url: Option<String>,

    #[serde(default = "default_metadata_refresh_secs")]
    pub metadata_refresh_secs: u64,

    /// Base64; must decode to at least 32 bytes.
    pub signing_key: String,

    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,

    #[serde(default = "default_session_max_age_secs")]
    pub session_max_age_secs: u64,

    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,

    #[serde(default = "default_true")]
    pub cookie_secure: bool,

    /// "strict", "lax" (default), or "none".
    #[serde(default = "default_same_site")]
    pub cookie_same_site: String,

    #[serde(default)]
    pub attributes: Option<AttributeMapping>,
}

fn default_saml_prefix() -> String {
    "/saml/".to_string()
}

fn default_metadata_refresh_secs() -> u64 {
    24 * 3600
}

fn default_session_cookie() -> String {
    "runway_session".to_string()
}

fn default_session_max_age_secs() -> u64 {
    8 * 3600
}

fn default_clock_skew_secs() -> u64 {
    90
}

fn default_same_site() -> String {
    "lax".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwtFileConfig {
    #[serde(default)]
    pub jwks_url: Option<String>,

    #[serde(default)]
    pub jwks_json: Option<String>,

    #[serde(default = "default_jwks_refresh_secs")]
    pub refresh_secs: u64,

    #[serde(default)]
    pub issuer: Option<String>,

    #[serde(default)]
    pub audience: Option<String>,
}

fn default_jwks_refresh_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthFileConfig {
    pub introspection_url: String,

    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    15
}

/// One route: match condition, handler, and its shaping/auth features.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Path prefix the structural router matches on.
    pub path_prefix: String,

    /// Allowed methods; empty means all.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub methods: Vec<String>,

    pub handler: HandlerConfig,

    /// Schemes that may satisfy authentication for this route; empty means
    /// anonymous. Any listed scheme succeeding admits the request.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub auth: Vec<String>,

    #[serde(default)]
    pub rate_limit: Option<RouteRateLimitConfig>,

    #[serde(default)]
    pub tiered: Option<TieredConfig>,

    #[serde(default)]
    pub throttle: Option<ThrottleConfig>,

    #[serde(default)]
    pub bandwidth: Option<BandwidthConfig>,

    #[serde(default)]
    pub priority: Option<PriorityConfig>,

    #[serde(default)]
    pub adaptive: Option<AdaptiveFileConfig>,

    #[serde(default)]
    pub fault: Option<FaultConfig>,

    #[serde(default)]
    pub mtls: Option<MtlsConfig>,

    #[serde(default)]
    pub signer: Option<SignerFileConfig>,

    /// Accept-header driven response re-encoding.
    #[serde(default)]
    pub negotiate: bool,

    /// Requests larger than this are rejected with 413.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HandlerConfig {
    /// Forward to a single upstream base URL.
    Proxy { upstream: String },
    /// Chain of templated backend calls.
    Composite { steps: Vec<StepConfig> },
    /// Canned response.
    Mock {
        #[serde(default = "default_mock_status")]
        status: u16,
        #[serde(default)]
        body: String,
        #[serde(default = "default_mock_content_type")]
        content_type: String,
    },
}

fn default_mock_status() -> u16 {
    200
}

fn default_mock_content_type() -> String {
    "application/json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRateLimitConfig {
    /// "bucket" (token bucket) or "window" (sliding window).
    #[serde(default = "default_route_rl_mode")]
    pub mode: String,

    pub rate: u64,

    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    #[serde(default)]
    pub burst: Option<u64>,

    #[serde(default = "default_key_strategy")]
    pub key: String,
}

fn default_route_rl_mode() -> String {
    "bucket".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredConfig {
    /// `header:<name>` or `claim:<name>`.
    pub source: String,

    #[serde(default = "default_key_strategy")]
    pub key: String,

    #[serde(default)]
    pub default_tier: Option<String>,

    pub tiers: Vec<TierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub rate: u64,
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
    #[serde(default)]
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub rate_per_sec: f64,

    #[serde(default = "default_throttle_burst")]
    pub burst: u64,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default)]
    pub per_ip: bool,
}

fn default_throttle_burst() -> u64 {
    1
}

fn default_max_wait_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandwidthConfig {
    #[serde(default)]
    pub request_bytes_per_sec: Option<u64>,

    #[serde(default)]
    pub response_bytes_per_sec: Option<u64>,

    #[serde(default)]
    pub request_burst: Option<u64>,

    #[serde(default)]
    pub response_burst: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub max_concurrent: usize,

    #[serde(default = "default_priority_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default)]
    pub default_level: Option<u32>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub rules: Vec<PriorityRuleConfig>,
}

fn default_priority_wait_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityRuleConfig {
    pub level: u32,

    /// All listed headers must match.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveFileConfig {
    #[serde(default = "default_adaptive_min")]
    pub min: u64,

    pub max: u64,

    #[serde(default = "default_adaptive_tolerance")]
    pub tolerance: f64,

    #[serde(default = "default_adaptive_alpha")]
    pub alpha: f64,

    #[serde(default = "default_adaptive_min_samples")]
    pub min_samples: u64,

    #[serde(default = "default_adaptive_interval_secs")]
    pub interval_secs: u64,
}

fn default_adaptive_min() -> u64 {
    1
}

fn default_adaptive_tolerance() -> f64 {
    1.5
}

fn default_adaptive_alpha() -> f64 {
    0.2
}

fn default_adaptive_min_samples() -> u64 {
    10
}

fn default_adaptive_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultConfig {
    #[serde(default)]
    pub abort_pct: f64,

    #[serde(default = "default_abort_status")]
    pub abort_status: u16,

    #[serde(default)]
    pub delay_pct: f64,

    #[serde(default)]
    pub delay_ms: u64,
}

fn default_abort_status() -> u16 {
    503
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtlsConfig {
    /// "request", "require", or "verify".
    pub mode: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub ca_files: Vec<String>,

    #[serde(default)]
    pub allow_expired: bool,

    #[serde(default)]
    pub header: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerFileConfig {
    pub algorithm: String,

    pub key_id: String,

    #[serde(default)]
    pub hmac_secret: Option<String>,

    #[serde(default)]
    pub rsa_key_pem: Option<String>,

    #[serde(default)]
    pub rsa_key_file: Option<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub signed_headers: Vec<String>,

    #[serde(default = "default_true")]
    pub include_body: bool,

    #[serde(default)]
    pub header_prefix: Option<String>,
}
