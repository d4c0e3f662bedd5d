use super::GatewayState;
use crate::auth::keys::{GenerateRequest, KeyRateLimit};
use crate::control::{ConfigEnvelope, ConfigSource};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Deserialize;
use std::time::Duration;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(status: u16, body: impl Into<Bytes>) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body("{}")))
}

fn error_response(status: u16, message: &str) -> Response<BoxBody> {
    json_response(
        status,
        serde_json::json!({"code": status, "message": message}).to_string(),
    )
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    key: String,
    client_id: String,
    #[serde(default)]
    name: Option<String>,
    /// RFC 3339.
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    rate_limit: Option<KeyRateLimit>,
}

#[derive(Deserialize)]
struct DeleteKeyRequest {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    prefix: Option<String>,
}

#[derive(Deserialize)]
struct RotateKeyRequest {
    prefix: String,
    #[serde(default = "default_grace_secs")]
    grace_secs: u64,
}

fn default_grace_secs() -> u64 {
    3600
}

#[derive(Deserialize)]
struct PushConfigRequest {
    #[serde(default)]
    version: u64,
    yaml: String,
    #[serde(default)]
    hash: Option<u64>,
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match (method.as_str(), path.as_str()) {
        ("GET", "/health") | ("GET", "/healthz") => {
            json_response(200, r#"{"status":"ok"}"#)
        }

        ("GET", "/ready") | ("GET", "/readyz") => {
            let routes = state.routes.load().routes().len();
            json_response(
                200,
                format!(r#"{{"status":"ready","routes":{}}}"#, routes),
            )
        }

        ("GET", "/metrics") => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap_or_else(|_| Response::new(full_body(""))),

        ("GET", "/admin/keys") => list_keys(&state),

        ("POST", "/admin/keys") => {
            let body = req.into_body().collect().await?.to_bytes();
            create_key(&state, &body)
        }

        ("DELETE", "/admin/keys") => {
            let body = req.into_body().collect().await?.to_bytes();
            revoke_key(&state, &body)
        }

        ("POST", "/admin/keys/rotate") => {
            let body = req.into_body().collect().await?.to_bytes();
            rotate_key(&state, &body)
        }

        ("POST", "/admin/config") => {
            let body = req.into_body().collect().await?.to_bytes();
            push_config(&state, &body)
        }

        ("GET", "/admin/config") => {
            let envelope = state.control.current_config();
            json_response(
                200,
                serde_json::json!({
                    "version": envelope.version,
                    "hash": envelope.hash,
                    "timestamp": envelope.timestamp.to_rfc3339(),
                    "source": envelope.source.as_str(),
                    "yaml_bytes": envelope.yaml.len(),
                })
                .to_string(),
            )
        }

        ("GET", "/admin/nodes") => {
            let nodes = state.control.nodes();
            json_response(
                200,
                serde_json::to_string_pretty(&nodes).unwrap_or_default(),
            )
        }

        ("GET", "/admin/stats") => route_stats(&state),

        _ => error_response(404, "not found"),
    };
    Ok(response)
}

/// `{prefix → metadata}`. The raw key is never present; only the prefix
/// handle and the irreversible mask identify it.
fn list_keys(state: &GatewayState) -> Response<BoxBody> {
    let Some(manager) = &state.auth.api_keys else {
        return error_response(404, "managed keys not enabled");
    };
    let keys: serde_json::Map<String, serde_json::Value> = manager
        .list()
        .into_iter()
        .map(|key| {
            let prefix = key.key_prefix.clone();
            let value = serde_json::json!({
                "key": key.masked_key,
                "client_id": key.client_id,
                "name": key.name,
                "roles": key.roles,
                "created_at": key.created_at.to_rfc3339(),
                "expires_at": key.expires_at.map(|at| at.to_rfc3339()),
                "revoked": key.revoked,
                "last_used_at": key.last_used_at.map(|at| at.to_rfc3339()),
                "usage_count": key.usage_count,
                "rotation_deadline": key.rotation_deadline.map(|at| at.to_rfc3339()),
            });
            (prefix, value)
        })
        .collect();
    json_response(
        200,
        serde_json::to_string_pretty(&keys).unwrap_or_default(),
    )
}

fn create_key(state: &GatewayState, body: &[u8]) -> Response<BoxBody> {
    let Some(manager) = &state.auth.api_keys else {
        return error_response(404, "managed keys not enabled");
    };
    let request: CreateKeyRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(400, &format!("bad request: {}", e)),
    };
    if request.key.len() < 16 {
        return error_response(400, "key must be at least 16 characters");
    }

    let expires_at = match &request.expires_at {
        Some(raw) => match DateTime::parse_from_rfc3339(raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(_) => return error_response(400, "expires_at must be RFC 3339"),
        },
        None => None,
    };

    let key = manager.register_raw(
        &request.key,
        GenerateRequest {
            client_id: request.client_id,
            name: request.name.unwrap_or_default(),
            roles: request.roles.unwrap_or_default(),
            ttl: None,
            rate_limit: request.rate_limit,
        },
    );
    if expires_at.is_some() {
        let _ = manager.set_expiry(&key.key_prefix, expires_at);
    }

    json_response(
        201,
        serde_json::json!({
            "prefix": key.key_prefix,
            "key": key.masked_key,
            "client_id": key.client_id,
        })
        .to_string(),
    )
}

fn revoke_key(state: &GatewayState, body: &[u8]) -> Response<BoxBody> {
    let Some(manager) = &state.auth.api_keys else {
        return error_response(404, "managed keys not enabled");
    };
    let request: DeleteKeyRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(400, &format!("bad request: {}", e)),
    };

    // Accept the raw key (hashed to find its handle) or the prefix directly.
    let prefix = match (&request.key, &request.prefix) {
        (Some(raw), _) => raw.chars().take(8).collect::<String>(),
        (None, Some(prefix)) => prefix.clone(),
        (None, None) => return error_response(400, "key or prefix required"),
    };

    match manager.revoke(&prefix) {
        Ok(()) => json_response(200, r#"{"revoked":true}"#),
        Err(_) => error_response(404, "unknown key"),
    }
}

fn rotate_key(state: &GatewayState, body: &[u8]) -> Response<BoxBody> {
    let Some(manager) = &state.auth.api_keys else {
        return error_response(404, "managed keys not enabled");
    };
    let request: RotateKeyRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(400, &format!("bad request: {}", e)),
    };

    match manager.rotate(&request.prefix, Duration::from_secs(request.grace_secs)) {
        // The raw replacement key is returned exactly once, here.
        Ok((raw, key)) => json_response(
            201,
            serde_json::json!({
                "key": raw,
                "prefix": key.key_prefix,
                "rotation_deadline_secs": request.grace_secs,
            })
            .to_string(),
        ),
        Err(e) => error_response(e.status(), &e.to_string()),
    }
}

fn push_config(state: &GatewayState, body: &[u8]) -> Response<BoxBody> {
    let request: PushConfigRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(400, &format!("bad request: {}", e)),
    };

    let hash = request
        .hash
        .unwrap_or_else(|| crate::control::envelope_hash(request.yaml.as_bytes()));
    let version = state.control.push_config(ConfigEnvelope {
        version: request.version,
        hash,
        yaml: Bytes::from(request.yaml.into_bytes()),
        timestamp: Utc::now(),
        source: ConfigSource::AdminApi,
        config: None,
    });

    json_response(
        200,
        serde_json::json!({"version": version, "hash": hash}).to_string(),
    )
}

fn route_stats(state: &GatewayState) -> Response<BoxBody> {
    let throttle = state.registries.throttlers.collect_stats(|t| {
        serde_json::json!({
            "total": t.stats.total.load(std::sync::atomic::Ordering::Relaxed),
            "throttled": t.stats.throttled.load(std::sync::atomic::Ordering::Relaxed),
            "timed_out": t.stats.timed_out.load(std::sync::atomic::Ordering::Relaxed),
            "avg_wait_us": t.stats.avg_wait().as_micros() as u64,
        })
    });
    let priority = state.registries.priority.collect_stats(|p| {
        serde_json::json!({
            "admitted": p.admitter.stats.admitted.load(std::sync::atomic::Ordering::Relaxed),
            "queued": p.admitter.stats.queued.load(std::sync::atomic::Ordering::Relaxed),
            "rejected": p.admitter.stats.rejected.load(std::sync::atomic::Ordering::Relaxed),
            "active": p.admitter.active(),
        })
    });
    let adaptive = state.registries.adaptive.collect_stats(|a| {
        serde_json::json!({
            "current_limit": a.current_limit(),
            "inflight": a.inflight(),
        })
    });
    let fault = state.registries.fault.collect_stats(|f| {
        serde_json::json!({
            "requests": f.stats.requests.load(std::sync::atomic::Ordering::Relaxed),
            "aborted": f.stats.aborted.load(std::sync::atomic::Ordering::Relaxed),
            "delayed": f.stats.delayed.load(std::sync::atomic::Ordering::Relaxed),
        })
    });
    let composer = state.registries.composers.collect_stats(|c| {
        let steps: Vec<_> = c
            .metrics()
            .iter()
            .map(|m| {
                serde_json::json!({
                    "requests": m.requests.load(std::sync::atomic::Ordering::Relaxed),
                    "errors": m.errors.load(std::sync::atomic::Ordering::Relaxed),
                    "total_latency_us": m.total_latency_us.load(std::sync::atomic::Ordering::Relaxed),
                })
            })
            .collect();
        serde_json::json!({"steps": steps})
    });

    json_response(
        200,
        serde_json::to_string_pretty(&serde_json::json!({
            "throttle": throttle,
            "priority": priority,
            "adaptive": adaptive,
            "fault": fault,
            "composer": composer,
        }))
        .unwrap_or_default(),
    )
}
