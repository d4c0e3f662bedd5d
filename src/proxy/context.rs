use crate::auth::Identity;
use crate::error::ApiError;
use crate::limiter::Decision;
use crate::tenant::TenantConfig;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through every pipeline phase, accumulating
/// identity, tenant, and shaping state on the way to the route handler.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: String,
    pub route_id: String,
    pub route_name: String,
    pub client_ip: IpAddr,
    pub request_id: String,
    pub start: Instant,
    pub identity: Option<Identity>,
    pub tenant: Option<Arc<TenantConfig>>,
    /// Tier decided upstream in the pipeline (tenant), overriding extraction.
    pub tier_override: Option<String>,
    /// Rate-limit decision to reflect in response headers.
    pub rate_limit: Option<Decision>,
    pub rate_limit_tier: Option<String>,
}

impl RequestContext {
    pub fn new(host: String, uri_path: String, method: String, client_ip: IpAddr) -> Self {
        Self {
            host,
            uri_path,
            method,
            route_id: String::new(),
            route_name: String::new(),
            client_ip,
            request_id: new_request_id(),
            start: Instant::now(),
            identity: None,
            tenant: None,
            tier_override: None,
            rate_limit: None,
            rate_limit_tier: None,
        }
    }

    /// Build the envelope response and record metrics in one place — the
    /// single exit point for every rejection path.
    pub fn error_response(&self, error: ApiError) -> hyper::Response<BoxBody> {
        let error = error.with_request_id(self.request_id.clone());
        let status =
            StatusCode::from_u16(error.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());
        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_label(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);
        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_label(),
        )
        .record(self.start.elapsed().as_secs_f64());

        let mut builder = hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json");

        if let Some(decision) = &self.rate_limit {
            builder = apply_rate_limit_headers(builder, decision, self.rate_limit_tier.as_deref());
            if !decision.allowed {
                builder = builder.header("retry-after", decision.retry_after_secs().to_string());
            }
        }

        builder
            .body(full_body(error.to_body()))
            .unwrap_or_else(|_| {
                hyper::Response::new(full_body(ApiError::internal().to_body()))
            })
    }

    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);
        metrics::counter!(
            "gateway_http_requests_total",
            "route" => self.route_label(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);
        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => self.route_label(),
        )
        .record(self.start.elapsed().as_secs_f64());
    }

    fn route_label(&self) -> String {
        if self.route_name.is_empty() {
            if self.route_id.is_empty() {
                "_no_route".to_string()
            } else {
                self.route_id.clone()
            }
        } else {
            self.route_name.clone()
        }
    }

    pub fn tenant_priority(&self) -> u32 {
        self.tenant.as_ref().map(|t| t.priority).unwrap_or(0)
    }
}

/// Stamp the `X-RateLimit-*` contract onto a response builder.
pub fn apply_rate_limit_headers(
    builder: http::response::Builder,
    decision: &Decision,
    tier: Option<&str>,
) -> http::response::Builder {
    let mut builder = builder
        .header("x-ratelimit-limit", decision.limit.to_string())
        .header("x-ratelimit-remaining", decision.remaining.to_string())
        .header("x-ratelimit-reset", decision.reset_unix_secs().to_string());
    if let Some(tier) = tier {
        builder = builder.header("x-ratelimit-tier", tier);
    }
    builder
}

/// Stamp the same contract onto an existing header map (success path).
pub fn apply_rate_limit_headers_map(
    headers: &mut http::HeaderMap,
    decision: &Decision,
    tier: Option<&str>,
) {
    let insert = |headers: &mut http::HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = http::HeaderValue::from_str(&value) {
            headers.insert(http::HeaderName::from_static(name), v);
        }
    };
    insert(headers, "x-ratelimit-limit", decision.limit.to_string());
    insert(
        headers,
        "x-ratelimit-remaining",
        decision.remaining.to_string(),
    );
    insert(
        headers,
        "x-ratelimit-reset",
        decision.reset_unix_secs().to_string(),
    );
    if let Some(tier) = tier {
        insert(headers, "x-ratelimit-tier", tier.to_string());
    }
}

fn new_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}
