use super::context::{
    apply_rate_limit_headers_map, empty_body, full_body, BoxBody, RequestContext,
};
use super::route::{CompiledRoute, RouteHandlerKind, RouteMatch};
use crate::auth::saml::SamlProvider;
use crate::auth::{AuthError, Identity};
use crate::composer::{RequestInfo, StepContext};
use crate::error::ApiError;
use crate::limiter::tiered::TieredDecision;
use crate::negotiate;
use crate::server::GatewayState;
use crate::tenant::{apply_tenant_headers, TenantMatch};
use http::header::{
    ACCEPT, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// Buffered-body ceiling when the route sets no explicit limit.
const DEFAULT_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

/// Handle one request through the fixed admission pipeline:
///
/// client-mTLS → bot detection → service-wide rate limit → tenant resolve →
/// authenticate → per-route rate limit / throttle / bandwidth → priority
/// admit → adaptive-concurrency admit → fault inject → route handler →
/// content-negotiate. Earliest rejection wins and writes the envelope once.
pub async fn handle_request(
    req: Request<BoxBody>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().clone();

    // Trust the left-most X-Forwarded-For entry (a trusted LB fronts the
    // gateway), else the TCP peer.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    // SSO endpoints sit outside the route table.
    if let Some(saml) = &state.auth.saml {
        if uri_path.starts_with(saml.path_prefix()) {
            return Ok(handle_saml(req, saml).await);
        }
    }

    let mut ctx = RequestContext::new(host, uri_path, method.as_str().to_string(), client_ip);

    let route = {
        let table = state.routes.load();
        match table.match_route(&ctx.uri_path, &method) {
            RouteMatch::Found(route) => route,
            RouteMatch::MethodNotAllowed => {
                return Ok(ctx.error_response(ApiError::method_not_allowed()));
            }
            RouteMatch::None => {
                debug!("proxy: no route matched, path={}", ctx.uri_path);
                return Ok(ctx.error_response(ApiError::not_found()));
            }
        }
    };
    ctx.route_id = route.id.clone();
    ctx.route_name = route.name.clone();

    // Client mTLS.
    if let Some(verifier) = state.registries.mtls.get(&route.id) {
        match verifier.verify(req.headers()) {
            Ok(Some(cert)) => {
                debug!(
                    "mtls: client verified, route={}, subject={}",
                    route.id, cert.subject
                );
            }
            Ok(None) => {}
            Err(e) => {
                metrics::counter!("gateway_mtls_rejected_total", "route" => route.id.clone())
                    .increment(1);
                return Ok(ctx.error_response(ApiError::forbidden().with_details(e.to_string())));
            }
        }
    }

    // Bot detection.
    if let Some(bot) = &state.service.bot {
        let ua = req
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if bot.is_blocked(ua) {
            metrics::counter!("gateway_bot_blocked_total").increment(1);
            return Ok(ctx.error_response(ApiError::forbidden().with_details("client blocked")));
        }
    }

    // Service-wide rate limit.
    if let Some(limiter) = &state.service.limiter {
        let decision = limiter.allow(req.headers(), client_ip, None).await;
        ctx.rate_limit = Some(decision);
        if !decision.allowed {
            metrics::counter!("gateway_rate_limit_rejected_total", "scope" => "service")
                .increment(1);
            return Ok(ctx.error_response(ApiError::too_many_requests()));
        }
    }

    // Tenant resolution.
    match state.service.tenants.resolve(req.headers(), &ctx.host) {
        TenantMatch::Tenant(tenant) => {
            ctx.tier_override = tenant.tier.clone();
            ctx.tenant = Some(tenant);
        }
        TenantMatch::Unknown => {
            return Ok(ctx.error_response(ApiError::forbidden().with_details("unknown tenant")));
        }
        TenantMatch::None => {}
    }

    // Authentication.
    if !route.auth_schemes.is_empty() {
        match authenticate(&route.auth_schemes, &state, req.headers()).await {
            Ok(identity) => ctx.identity = Some(identity),
            Err(error) => {
                metrics::counter!(
                    "gateway_auth_failures_total",
                    "route" => route.id.clone(),
                )
                .increment(1);
                let api_error = match &error {
                    AuthError::RateLimited { retry_after_secs } => {
                        let mut response =
                            ctx.error_response(ApiError::too_many_requests());
                        set_retry_after(&mut response, *retry_after_secs);
                        return Ok(response);
                    }
                    other => ApiError::new(other.status(), "authentication failed")
                        .with_details(error.to_string()),
                };
                return Ok(ctx.error_response(api_error));
            }
        }
    }

    // Per-route rate limit.
    if let Some(limiter) = state.registries.rate_limits.get(&route.id) {
        let decision = limiter.allow(req.headers(), client_ip, ctx.identity.as_ref());
        ctx.rate_limit = Some(decision);
        if !decision.allowed {
            metrics::counter!("gateway_rate_limit_rejected_total", "scope" => "route")
                .increment(1);
            return Ok(ctx.error_response(ApiError::too_many_requests()));
        }
    }

    // Tiered rate limit.
    if let Some(tiered) = state.registries.tiered.get(&route.id) {
        match tiered.allow(
            req.headers(),
            client_ip,
            ctx.identity.as_ref(),
            ctx.tier_override.as_deref(),
        ) {
            TieredDecision::Limited { tier, decision } => {
                ctx.rate_limit = Some(decision);
                ctx.rate_limit_tier = Some(tier);
                if !decision.allowed {
                    metrics::counter!("gateway_rate_limit_rejected_total", "scope" => "tier")
                        .increment(1);
                    return Ok(ctx.error_response(ApiError::too_many_requests()));
                }
            }
            TieredDecision::PassThrough => {}
        }
    }

    // Throttle (wait-based smoothing).
    if let Some(throttler) = state.registries.throttlers.get(&route.id) {
        if throttler.acquire(client_ip).await.is_err() {
            metrics::counter!("gateway_throttle_timeouts_total", "route" => route.id.clone())
                .increment(1);
            let mut response = ctx.error_response(ApiError::too_many_requests());
            set_retry_after(&mut response, 1);
            return Ok(response);
        }
    }

    // Priority admission.
    let _priority_permit = match state.registries.priority.get(&route.id) {
        Some(entry) => {
            let level =
                entry
                    .selector
                    .select(req.headers(), ctx.identity.as_ref(), ctx.tenant_priority());
            match entry.admitter.admit(level, entry.max_wait).await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    metrics::counter!(
                        "gateway_priority_rejected_total",
                        "route" => route.id.clone(),
                    )
                    .increment(1);
                    let mut response = ctx.error_response(ApiError::too_many_requests());
                    set_retry_after(&mut response, 1);
                    return Ok(response);
                }
            }
        }
        None => None,
    };

    // Adaptive concurrency.
    let adaptive_permit = match state.registries.adaptive.get(&route.id) {
        Some(limiter) => match limiter.try_acquire() {
            Some(permit) => Some(permit),
            None => {
                metrics::counter!(
                    "gateway_adaptive_rejected_total",
                    "route" => route.id.clone(),
                )
                .increment(1);
                let mut response = ctx.error_response(ApiError::too_many_requests());
                set_retry_after(&mut response, 1);
                return Ok(response);
            }
        },
        None => None,
    };

    // Fault injection.
    if let Some(injector) = state.registries.fault.get(&route.id) {
        if let crate::shaping::fault::FaultOutcome::Aborted(status) = injector.apply().await {
            return Ok(ctx.error_response(ApiError::new(status, "injected fault")));
        }
    }

    // Route handler.
    let accept = req
        .headers()
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let handler_start = Instant::now();
    let result = dispatch(req, &route, &state, &ctx).await;
    let handler_latency = handler_start.elapsed();

    match result {
        Ok(mut response) => {
            if let Some(permit) = adaptive_permit {
                permit.release(response.status().as_u16(), handler_latency);
            }
            response = postprocess(response, &route, &state, &ctx, accept.as_deref()).await;
            let status = response.status().as_u16();
            ctx.finalize_metrics(status);
            access_log(&ctx, status, handler_latency);
            Ok(response)
        }
        Err(error) => {
            if let Some(permit) = adaptive_permit {
                permit.release(error.code, handler_latency);
            }
            Ok(ctx.error_response(error))
        }
    }
}

/// Try each configured scheme in order. A scheme whose credentials are
/// present decides the outcome; schemes with nothing presented are skipped.
async fn authenticate(
    schemes: &[String],
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<Identity, AuthError> {
    for scheme in schemes {
        match scheme.as_str() {
            "api_key" => {
                if let Some(manager) = &state.auth.api_keys {
                    if let Some(raw) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
                        return manager.authenticate(raw);
                    }
                }
            }
            "jwt" => {
                if let Some(jwt) = &state.auth.jwt {
                    if crate::auth::jwt::bearer_token(headers).is_some() {
                        return jwt.authenticate(headers);
                    }
                }
            }
            "oauth" => {
                if let Some(oauth) = &state.auth.oauth {
                    if crate::auth::jwt::bearer_token(headers).is_some() {
                        return oauth.authenticate(headers).await;
                    }
                }
            }
            "saml" => {
                if let Some(saml) = &state.auth.saml {
                    let presented = headers.contains_key(crate::auth::saml::ASSERTION_HEADER)
                        || crate::limiter::key::cookie_value(headers, saml.session_cookie_name())
                            .is_some();
                    if presented {
                        return saml.authenticate(headers);
                    }
                }
            }
            "basic" => {
                if let Some(basic) = &state.auth.basic {
                    let presented = headers
                        .get(http::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.starts_with("Basic "))
                        .unwrap_or(false);
                    if presented {
                        return basic.authenticate(headers);
                    }
                }
            }
            _ => {}
        }
    }
    Err(AuthError::InvalidCredentials("no credentials".into()))
}

async fn dispatch(
    req: Request<BoxBody>,
    route: &Arc<CompiledRoute>,
    state: &GatewayState,
    ctx: &RequestContext,
) -> Result<Response<BoxBody>, ApiError> {
    match &route.handler {
        RouteHandlerKind::Mock {
            status,
            content_type,
            body,
        } => Ok(Response::builder()
            .status(*status)
            .header(CONTENT_TYPE, content_type)
            .body(full_body(body.clone()))
            .unwrap_or_else(|_| Response::new(empty_body()))),
        RouteHandlerKind::Composite => run_composer(req, route, state).await,
        RouteHandlerKind::Proxy { upstream, client } => {
            forward(req, route, state, ctx, upstream, client).await
        }
    }
}

async fn forward(
    req: Request<BoxBody>,
    route: &Arc<CompiledRoute>,
    state: &GatewayState,
    ctx: &RequestContext,
    upstream: &str,
    client: &super::route::HttpClient,
) -> Result<Response<BoxBody>, ApiError> {
    let max_body = route.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES);

    // Early reject on declared length.
    if let Some(declared) = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if declared > max_body {
            return Err(ApiError::payload_too_large());
        }
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let method = req.method().clone();
    let (parts, body) = req.into_parts();

    // The request body is buffered: the signer needs the digest and the
    // bandwidth budget paces the read from the client either way.
    let mut body = body;
    let bandwidth = state.registries.bandwidth.get(&route.id);
    if let Some(bandwidth) = &bandwidth {
        body = bandwidth.wrap_request(body);
    }
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| {
            warn!("proxy: request body read failed, route={}, error={}", route.id, e);
            ApiError::bad_request()
        })?
        .to_bytes();
    if body_bytes.len() as u64 > max_body {
        return Err(ApiError::payload_too_large());
    }

    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);
    inject_forwarded_headers(&mut headers, ctx);

    if let Some(signer) = state.registries.signers.get(&route.id) {
        let body_opt = (!body_bytes.is_empty()).then_some(body_bytes.as_ref());
        let signature = signer
            .sign(method.as_str(), &path_and_query, &ctx.host, &headers, body_opt)
            .map_err(|e| {
                warn!("proxy: signing failed, route={}, error={}", route.id, e);
                ApiError::internal()
            })?;
        for (name, value) in signature.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }

    let uri = format!("{}{}", upstream, path_and_query);
    let mut builder = Request::builder().method(method).uri(&uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = builder
        .body(full_body(body_bytes))
        .map_err(|_| ApiError::internal())?;

    let response = match tokio::time::timeout(UPSTREAM_TIMEOUT, client.request(upstream_req)).await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!("proxy: upstream error, route={}, uri={}, error={}", route.id, uri, e);
            metrics::counter!("gateway_upstream_errors_total", "route" => route.id.clone())
                .increment(1);
            return Err(ApiError::bad_gateway());
        }
        Err(_) => {
            warn!("proxy: upstream timeout, route={}, uri={}", route.id, uri);
            return Err(ApiError::gateway_timeout());
        }
    };

    let (parts, body) = response.into_parts();
    let mut response = Response::from_parts(parts, body.boxed());
    remove_hop_headers(response.headers_mut());
    Ok(response)
}

async fn run_composer(
    req: Request<BoxBody>,
    route: &Arc<CompiledRoute>,
    state: &GatewayState,
) -> Result<Response<BoxBody>, ApiError> {
    let Some(composer) = state.registries.composers.get(&route.id) else {
        return Err(ApiError::internal());
    };

    let uri = req.uri().clone();
    let rest = uri
        .path()
        .strip_prefix(route.path_prefix.as_str())
        .unwrap_or("")
        .trim_start_matches('/')
        .to_string();

    let mut headers_map = std::collections::HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers_map.insert(name.as_str().to_string(), v.to_string());
        }
    }

    let seed = StepContext {
        request: RequestInfo {
            method: req.method().as_str().to_string(),
            url: uri.to_string(),
            host: req
                .headers()
                .get(HOST)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string(),
            path: uri.path().to_string(),
            // The structural router is external; the prefix remainder is the
            // one parameter this stand-in can offer.
            path_params: std::collections::HashMap::from([("rest".to_string(), rest)]),
            query: parse_query(uri.query().unwrap_or("")),
            headers: headers_map,
        },
        ..StepContext::default()
    };

    let composed = composer.execute(seed).await.map_err(|e| {
        metrics::counter!("gateway_composer_errors_total", "route" => route.id.clone())
            .increment(1);
        ApiError::bad_gateway().with_details(e.to_string())
    })?;

    let mut builder = Response::builder().status(composed.status);
    for (name, value) in &composed.headers {
        if *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || *name == CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(full_body(composed.body))
        .map_err(|_| ApiError::internal())
}

/// Response-phase transforms: content negotiation, bandwidth shaping,
/// tenant headers, rate-limit headers.
async fn postprocess(
    mut response: Response<BoxBody>,
    route: &Arc<CompiledRoute>,
    state: &GatewayState,
    ctx: &RequestContext,
    accept: Option<&str>,
) -> Response<BoxBody> {
    if route.negotiate {
        if let Some(target) = accept.and_then(negotiate::negotiate) {
            let is_json = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("json"))
                .unwrap_or(false);
            if is_json {
                let (mut parts, body) = response.into_parts();
                match body.collect().await {
                    Ok(collected) => {
                        let original = collected.to_bytes();
                        match negotiate::transcode(&original, target) {
                            Some((transcoded, content_type)) => {
                                parts
                                    .headers
                                    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                                parts.headers.remove(CONTENT_LENGTH);
                                response = Response::from_parts(parts, full_body(transcoded));
                            }
                            None => {
                                response = Response::from_parts(parts, full_body(original));
                            }
                        }
                    }
                    Err(_) => {
                        // Body already consumed or failed; return what we can.
                        response = Response::from_parts(parts, empty_body());
                    }
                }
            }
        }
    }

    if let Some(bandwidth) = state.registries.bandwidth.get(&route.id) {
        if bandwidth.limits_response() {
            let (mut parts, body) = response.into_parts();
            // Pacing makes the final length timing-dependent for streams.
            parts.headers.remove(CONTENT_LENGTH);
            response = Response::from_parts(parts, bandwidth.wrap_response(body));
        }
    }

    if let Some(tenant) = &ctx.tenant {
        apply_tenant_headers(tenant, response.headers_mut());
    }
    if let Some(decision) = &ctx.rate_limit {
        apply_rate_limit_headers_map(
            response.headers_mut(),
            decision,
            ctx.rate_limit_tier.as_deref(),
        );
    }
    response
}

// -- SAML endpoints ------------------------------------------------------------

async fn handle_saml(req: Request<BoxBody>, saml: &Arc<SamlProvider>) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let endpoint = path
        .strip_prefix(saml.path_prefix())
        .unwrap_or("")
        .trim_matches('/')
        .to_string();

    if method == Method::GET && endpoint == "metadata" {
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/samlmetadata+xml")
            .body(full_body(saml.sp_metadata_xml()))
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    let result = if method == Method::GET && endpoint == "login" {
        let return_to = query_value(&query, "return_to");
        saml.start_login(return_to.as_deref())
    } else if method == Method::POST && endpoint == "acs" {
        match req.into_body().collect().await {
            Ok(collected) => saml.consume_acs(&collected.to_bytes()),
            Err(_) => Err(AuthError::InvalidCredentials("unreadable body".into())),
        }
    } else if method == Method::GET && endpoint == "slo" {
        let request = query_value(&query, "SAMLRequest");
        saml.logout(request.as_deref())
    } else if method == Method::POST && endpoint == "slo" {
        match req.into_body().collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                let request = query_value(&String::from_utf8_lossy(&body), "SAMLRequest");
                saml.logout(request.as_deref())
            }
            Err(_) => Err(AuthError::InvalidCredentials("unreadable body".into())),
        }
    } else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(ApiError::not_found().to_body()))
            .unwrap_or_else(|_| Response::new(empty_body()));
    };

    match result {
        Ok(redirect) => {
            let mut builder = Response::builder()
                .status(StatusCode::FOUND)
                .header(http::header::LOCATION, redirect.location);
            if let Some(cookie) = redirect.set_cookie {
                builder = builder.header(http::header::SET_COOKIE, cookie);
            }
            builder
                .body(empty_body())
                .unwrap_or_else(|_| Response::new(empty_body()))
        }
        Err(error) => Response::builder()
            .status(StatusCode::from_u16(error.status()).unwrap_or(StatusCode::UNAUTHORIZED))
            .header(CONTENT_TYPE, "application/json")
            .body(full_body(
                ApiError::new(error.status(), "authentication failed")
                    .with_details(error.to_string())
                    .to_body(),
            ))
            .unwrap_or_else(|_| Response::new(empty_body())),
    }
}

// -- helpers -------------------------------------------------------------------

fn set_retry_after(response: &mut Response<BoxBody>, secs: u64) {
    if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("retry-after"), value);
    }
}

fn parse_query(query: &str) -> std::collections::HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((url_decode(k), url_decode(v)))
        })
        .collect()
}

fn query_value(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| url_decode(v))
    })
}

fn url_decode(s: &str) -> String {
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
                    continue;
                }
                out.push(b'%');
                i += 1;
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

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];
    for h in hop_headers {
        headers.remove(h);
    }
}

fn inject_forwarded_headers(headers: &mut HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let client_ip = ctx.client_ip.to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let combined = format!("{}, {}", existing, client_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }
    if !ctx.host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&ctx.host) {
            headers.insert(XFH.clone(), v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&client_ip) {
        headers.insert(XRI.clone(), v);
    }
}

fn access_log(ctx: &RequestContext, status: u16, handler_latency: Duration) {
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = status,
        route = %ctx.route_name,
        request_id = %ctx.request_id,
        latency_ms = %ctx.start.elapsed().as_millis(),
        handler_ms = %handler_latency.as_millis(),
        "access"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn peer() -> SocketAddr {
        "10.9.9.9:55555".parse().unwrap()
    }

    fn request(method: &str, path: &str) -> Request<BoxBody> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, "gw.example.com")
            .body(empty_body())
            .unwrap()
    }

    async fn state(config: serde_json::Value) -> GatewayState {
        let config: GatewayConfig = serde_json::from_value(config).unwrap();
        GatewayState::new(config).await.unwrap()
    }

    async fn body_json(response: Response<BoxBody>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_path_is_404_envelope() {
        let state = state(serde_json::json!({})).await;
        let response = handle_request(request("GET", "/nope"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], 404);
        assert!(body["request_id"].is_string());
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let state = state(serde_json::json!({
            "routes": [{
                "id": "w", "path_prefix": "/write", "methods": ["POST"],
                "handler": {"kind": "mock"},
            }]
        }))
        .await;
        let response = handle_request(request("GET", "/write"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_mock_route_end_to_end() {
        let state = state(serde_json::json!({
            "routes": [{
                "id": "m", "path_prefix": "/hello",
                "handler": {"kind": "mock", "status": 200, "body": "{\"hi\":true}"},
            }]
        }))
        .await;
        let response = handle_request(request("GET", "/hello"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["hi"], true);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_credentials_is_401() {
        let state = state(serde_json::json!({
            "auth": {"api_keys": {}},
            "routes": [{
                "id": "s", "path_prefix": "/secure", "auth": ["api_key"],
                "handler": {"kind": "mock"},
            }]
        }))
        .await;
        let response = handle_request(request("GET", "/secure"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_api_key_auth_and_rate_limit_headers() {
        let state = state(serde_json::json!({
            "auth": {"api_keys": {}},
            "routes": [{
                "id": "s", "path_prefix": "/secure", "auth": ["api_key"],
                "handler": {"kind": "mock"},
                "rate_limit": {"mode": "bucket", "rate": 2, "burst": 2, "key": "client_id"},
            }]
        }))
        .await;
        let (raw, _) = state
            .auth
            .api_keys
            .as_ref()
            .unwrap()
            .generate(crate::auth::keys::GenerateRequest {
                client_id: "acme".into(),
                ..Default::default()
            });

        let authed = |raw: &str| {
            Request::builder()
                .method("GET")
                .uri("/secure")
                .header(HOST, "gw.example.com")
                .header("x-api-key", raw)
                .body(empty_body())
                .unwrap()
        };

        let ok = handle_request(authed(&raw), state.clone(), peer()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers().get("x-ratelimit-limit").unwrap(), "2");
        assert_eq!(ok.headers().get("x-ratelimit-remaining").unwrap(), "1");

        let _ = handle_request(authed(&raw), state.clone(), peer()).await.unwrap();
        let limited = handle_request(authed(&raw), state.clone(), peer()).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().get("retry-after").is_some());
        assert_eq!(limited.headers().get("x-ratelimit-remaining").unwrap(), "0");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_bot_blocked() {
        let state = state(serde_json::json!({
            "service": {"bot": {"deny": ["(?i)badbot"]}},
            "routes": [{"id": "m", "path_prefix": "/", "handler": {"kind": "mock"}}]
        }))
        .await;

        let bot_req = Request::builder()
            .method("GET")
            .uri("/x")
            .header(USER_AGENT, "BadBot/1.0")
            .body(empty_body())
            .unwrap();
        let response = handle_request(bot_req, state.clone(), peer()).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let ok = handle_request(request("GET", "/x"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_403_and_known_stamps_headers() {
        let state = state(serde_json::json!({
            "tenants": [{"id": "acme", "metadata": {"region": "eu-1"}}],
            "routes": [{"id": "m", "path_prefix": "/", "handler": {"kind": "mock"}}]
        }))
        .await;

        let with_tenant = |tenant: &str| {
            Request::builder()
                .method("GET")
                .uri("/x")
                .header("x-tenant-id", tenant)
                .body(empty_body())
                .unwrap()
        };

        let unknown = handle_request(with_tenant("nobody"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::FORBIDDEN);

        let known = handle_request(with_tenant("acme"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(known.status(), StatusCode::OK);
        assert_eq!(known.headers().get("x-tenant-id").unwrap(), "acme");
        assert_eq!(known.headers().get("x-tenant-region").unwrap(), "eu-1");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_fault_abort_short_circuits() {
        let state = state(serde_json::json!({
            "routes": [{
                "id": "f", "path_prefix": "/",
                "handler": {"kind": "mock"},
                "fault": {"abort_pct": 100.0, "abort_status": 503, "delay_pct": 100.0, "delay_ms": 5000},
            }]
        }))
        .await;

        let start = Instant::now();
        let response = handle_request(request("GET", "/x"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(start.elapsed() < Duration::from_secs(1));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_negotiate_transcodes_mock_json() {
        let state = state(serde_json::json!({
            "routes": [{
                "id": "n", "path_prefix": "/",
                "handler": {"kind": "mock", "body": "{\"name\":\"alice\"}"},
                "negotiate": true,
            }]
        }))
        .await;

        let req = Request::builder()
            .method("GET")
            .uri("/x")
            .header(ACCEPT, "application/yaml")
            .body(empty_body())
            .unwrap();
        let response = handle_request(req, state.clone(), peer()).await.unwrap();
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/yaml"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("name: alice"));
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_saml_endpoints_served() {
        let state = state(serde_json::json!({
            "auth": {"saml": {
                "sp_entity_id": "gw",
                "sp_base_url": "https://gw.example.com",
                "idp_sso_url": "https://idp.example.com/sso",
                "signing_key": "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=",
            }},
        }))
        .await;

        let metadata = handle_request(request("GET", "/saml/metadata"), state.clone(), peer())
            .await
            .unwrap();
        assert_eq!(metadata.status(), StatusCode::OK);
        assert_eq!(
            metadata.headers().get(CONTENT_TYPE).unwrap(),
            "application/samlmetadata+xml"
        );

        let login = handle_request(
            request("GET", "/saml/login?return_to=%2Fdash"),
            state.clone(),
            peer(),
        )
        .await
        .unwrap();
        assert_eq!(login.status(), StatusCode::FOUND);
        let location = login.headers().get(http::header::LOCATION).unwrap();
        assert!(location
            .to_str()
            .unwrap()
            .starts_with("https://idp.example.com/sso?"));
        state.shutdown().await;
    }

    #[test]
    fn test_query_helpers() {
        let params = parse_query("a=1&b=x%20y&c=");
        assert_eq!(params["a"], "1");
        assert_eq!(params["b"], "x y");
        assert_eq!(params["c"], "");
        assert_eq!(query_value("a=1&b=2", "b").as_deref(), Some("2"));
        assert!(query_value("a=1", "z").is_none());
    }
}
