use super::context::BoxBody;
use crate::auth::mtls::{MtlsMode, MtlsVerifier};
use crate::auth::Identity;
use crate::composer::SequentialComposer;
use crate::config::{GatewayConfig, HandlerConfig, RouteConfig};
use crate::limiter::tiered::TierSource;
use crate::limiter::{
    Decision, KeyStrategy, SlidingWindowLimiter, TieredLimiter, TokenBucketLimiter,
};
use crate::registry::RouteRegistry;
use crate::shaping::bandwidth::ByteBudget;
use crate::shaping::priority::{LevelSelector, PriorityRule};
use crate::shaping::{
    AdaptiveLimiter, BandwidthLimiter, FaultInjector, PriorityAdmitter, Throttler,
};
use crate::signer::{RequestSigner, SignerConfig};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub type HttpClient = hyper_util::client::legacy::Client<
    hyper_util::client::legacy::connect::HttpConnector,
    BoxBody,
>;

/// Per-route rate limiter: algorithm plus the key strategy that scopes it.
pub enum RouteLimiter {
    Bucket {
        limiter: TokenBucketLimiter,
        key: KeyStrategy,
    },
    Window {
        limiter: SlidingWindowLimiter,
        key: KeyStrategy,
    },
}

impl RouteLimiter {
    pub fn allow(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
        identity: Option<&Identity>,
    ) -> Decision {
        match self {
            RouteLimiter::Bucket { limiter, key } => {
                limiter.allow(&key.extract(headers, client_ip, identity))
            }
            RouteLimiter::Window { limiter, key } => {
                limiter.allow(&key.extract(headers, client_ip, identity))
            }
        }
    }
}

/// Priority admission bundle for one route.
pub struct PriorityEntry {
    pub admitter: Arc<PriorityAdmitter>,
    pub selector: LevelSelector,
    pub max_wait: Duration,
}

/// One registry per feature: add/lookup/stats are uniform across features,
/// and removing a route id tears the whole per-route state down.
pub struct FeatureRegistries {
    pub rate_limits: RouteRegistry<RouteLimiter>,
    pub tiered: RouteRegistry<TieredLimiter>,
    pub throttlers: RouteRegistry<Throttler>,
    pub bandwidth: RouteRegistry<BandwidthLimiter>,
    pub priority: RouteRegistry<PriorityEntry>,
    pub adaptive: RouteRegistry<AdaptiveLimiter>,
    pub fault: RouteRegistry<FaultInjector>,
    pub mtls: RouteRegistry<MtlsVerifier>,
    pub signers: RouteRegistry<RequestSigner>,
    pub composers: RouteRegistry<SequentialComposer>,
}

impl FeatureRegistries {
    pub fn new() -> Self {
        Self {
            rate_limits: RouteRegistry::new(),
            tiered: RouteRegistry::new(),
            throttlers: RouteRegistry::new(),
            bandwidth: RouteRegistry::new(),
            priority: RouteRegistry::new(),
            adaptive: RouteRegistry::new(),
            fault: RouteRegistry::new(),
            mtls: RouteRegistry::new(),
            signers: RouteRegistry::new(),
            composers: RouteRegistry::new(),
        }
    }

    /// Stop background work owned by per-route features.
    pub async fn stop_all(&self) {
        self.throttlers.range(|_, throttler| throttler.stop());
        let limiters: Vec<_> = {
            let mut collected = Vec::new();
            self.adaptive.range(|_, limiter| collected.push(limiter.clone()));
            collected
        };
        for limiter in limiters {
            limiter.stop().await;
        }
    }
}

impl Default for FeatureRegistries {
    fn default() -> Self {
        Self::new()
    }
}

/// How a matched route produces its response.
pub enum RouteHandlerKind {
    Proxy { upstream: String, client: HttpClient },
    /// Steps live in the composer registry under the route id.
    Composite,
    Mock {
        status: StatusCode,
        content_type: String,
        body: Bytes,
    },
}

pub struct CompiledRoute {
    pub id: String,
    pub name: String,
    pub path_prefix: String,
    /// Empty means all methods.
    pub methods: Vec<Method>,
    pub auth_schemes: Vec<String>,
    pub handler: RouteHandlerKind,
    pub negotiate: bool,
    pub max_body_bytes: Option<u64>,
}

pub enum RouteMatch {
    Found(Arc<CompiledRoute>),
    MethodNotAllowed,
    None,
}

/// Longest-prefix route table. The structural router proper is an external
/// collaborator; this stand-in gives the pipeline its lookup interface.
pub struct RouteTable {
    /// Sorted by prefix length, longest first.
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(mut routes: Vec<Arc<CompiledRoute>>) -> Self {
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Self { routes }
    }

    pub fn empty() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn match_route(&self, path: &str, method: &Method) -> RouteMatch {
        let mut prefix_hit = false;
        for route in &self.routes {
            if !path_matches(path, &route.path_prefix) {
                continue;
            }
            prefix_hit = true;
            if route.methods.is_empty() || route.methods.contains(method) {
                return RouteMatch::Found(route.clone());
            }
        }
        if prefix_hit {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::None
        }
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }
}

fn path_matches(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Compile the route list: every per-route feature instance is built here,
/// validated, installed into its registry, and its background work started.
/// Any invalid feature config refuses the whole load.
pub fn build_routes(
    config: &GatewayConfig,
    registries: &FeatureRegistries,
) -> Result<RouteTable> {
    let mut compiled = Vec::with_capacity(config.routes.len());

    for route in &config.routes {
        compiled.push(Arc::new(
            build_route(route, registries)
                .with_context(|| format!("compiling route {:?}", route.id))?,
        ));
    }

    metrics::gauge!("gateway_config_routes_total").set(compiled.len() as f64);
    Ok(RouteTable::new(compiled))
}

fn build_route(route: &RouteConfig, registries: &FeatureRegistries) -> Result<CompiledRoute> {
    let methods = route
        .methods
        .iter()
        .map(|m| Method::from_bytes(m.as_bytes()).with_context(|| format!("bad method {:?}", m)))
        .collect::<Result<Vec<_>>>()?;

    if let Some(rl) = &route.rate_limit {
        let key = KeyStrategy::parse(&rl.key);
        let period = Some(Duration::from_secs(rl.period_secs));
        let limiter = match rl.mode.as_str() {
            "window" => RouteLimiter::Window {
                limiter: SlidingWindowLimiter::new(rl.rate, period, rl.burst),
                key,
            },
            "bucket" => RouteLimiter::Bucket {
                limiter: TokenBucketLimiter::new(rl.rate, period, rl.burst),
                key,
            },
            other => bail!("unknown rate_limit mode {:?}", other),
        };
        registries.rate_limits.add(&route.id, Arc::new(limiter));
    }

    if let Some(tiered) = &route.tiered {
        let source = if let Some(name) = tiered.source.strip_prefix("header:") {
            TierSource::Header(name.to_string())
        } else if let Some(name) = tiered.source.strip_prefix("claim:") {
            TierSource::Claim(name.to_string())
        } else {
            bail!("tiered source must be header:<name> or claim:<name>");
        };
        let mut limiter = TieredLimiter::new(
            source,
            KeyStrategy::parse(&tiered.key),
            tiered.default_tier.clone(),
        );
        for tier in &tiered.tiers {
            limiter.add_tier(
                &tier.name,
                tier.rate,
                Some(Duration::from_secs(tier.period_secs)),
                tier.burst,
            );
        }
        registries.tiered.add(&route.id, Arc::new(limiter));
    }

    if let Some(throttle) = &route.throttle {
        let throttler = Arc::new(Throttler::new(
            throttle.rate_per_sec,
            throttle.burst,
            Duration::from_millis(throttle.max_wait_ms),
            throttle.per_ip,
        ));
        throttler.start_eviction();
        registries.throttlers.add(&route.id, throttler);
    }

    if let Some(bandwidth) = &route.bandwidth {
        let request = bandwidth
            .request_bytes_per_sec
            .map(|rate| Arc::new(ByteBudget::new(rate, bandwidth.request_burst)));
        let response = bandwidth
            .response_bytes_per_sec
            .map(|rate| Arc::new(ByteBudget::new(rate, bandwidth.response_burst)));
        registries
            .bandwidth
            .add(&route.id, Arc::new(BandwidthLimiter::new(request, response)));
    }

    if let Some(priority) = &route.priority {
        let rules = priority
            .rules
            .iter()
            .map(|rule| PriorityRule {
                level: rule.level,
                headers: rule.headers.clone().into_iter().collect(),
                client_id: rule.client_id.clone(),
            })
            .collect();
        registries.priority.add(
            &route.id,
            Arc::new(PriorityEntry {
                admitter: PriorityAdmitter::new(priority.max_concurrent),
                selector: LevelSelector::new(rules, priority.default_level),
                max_wait: Duration::from_millis(priority.max_wait_ms),
            }),
        );
    }

    if let Some(adaptive) = &route.adaptive {
        let limiter = AdaptiveLimiter::new(crate::shaping::adaptive::AdaptiveConfig {
            min_limit: adaptive.min,
            max_limit: adaptive.max,
            tolerance: adaptive.tolerance,
            alpha: adaptive.alpha,
            min_samples: adaptive.min_samples,
            adjustment_interval: Duration::from_secs(adaptive.interval_secs),
        });
        limiter.start();
        registries.adaptive.add(&route.id, limiter);
    }

    if let Some(fault) = &route.fault {
        registries.fault.add(
            &route.id,
            Arc::new(FaultInjector::new(
                fault.abort_pct,
                fault.abort_status,
                fault.delay_pct,
                Duration::from_millis(fault.delay_ms),
            )),
        );
    }

    if let Some(mtls) = &route.mtls {
        let mode = MtlsMode::parse(&mtls.mode)
            .with_context(|| format!("unknown mtls mode {:?}", mtls.mode))?;
        let verifier = MtlsVerifier::new(
            mode,
            &mtls.ca_files.iter().map(std::path::PathBuf::from).collect::<Vec<_>>(),
            mtls.allow_expired,
            mtls.header.clone(),
        )?;
        registries.mtls.add(&route.id, Arc::new(verifier));
    }

    if let Some(signer) = &route.signer {
        let signer = RequestSigner::new(SignerConfig {
            algorithm: signer.algorithm.clone(),
            key_id: signer.key_id.clone(),
            hmac_secret: signer.hmac_secret.clone(),
            rsa_key_pem: signer.rsa_key_pem.clone(),
            rsa_key_file: signer.rsa_key_file.clone(),
            signed_headers: signer.signed_headers.clone(),
            include_body: signer.include_body,
            header_prefix: signer.header_prefix.clone(),
        })?;
        registries.signers.add(&route.id, Arc::new(signer));
    }

    let handler = match &route.handler {
        HandlerConfig::Proxy { upstream } => RouteHandlerKind::Proxy {
            upstream: upstream.trim_end_matches('/').to_string(),
            client: hyper_util::client::legacy::Client::builder(
                hyper_util::rt::TokioExecutor::new(),
            )
            .build_http(),
        },
        HandlerConfig::Composite { steps } => {
            let composer = SequentialComposer::new(steps)?;
            registries.composers.add(&route.id, Arc::new(composer));
            RouteHandlerKind::Composite
        }
        HandlerConfig::Mock {
            status,
            body,
            content_type,
        } => RouteHandlerKind::Mock {
            status: StatusCode::from_u16(*status).context("bad mock status")?,
            content_type: content_type.clone(),
            body: Bytes::from(body.clone()),
        },
    };

    Ok(CompiledRoute {
        id: route.id.clone(),
        name: if route.name.is_empty() {
            route.id.clone()
        } else {
            route.name.clone()
        },
        path_prefix: route.path_prefix.clone(),
        methods,
        auth_schemes: route.auth.clone(),
        handler,
        negotiate: route.negotiate,
        max_body_bytes: route.max_body_bytes,
    })
}
