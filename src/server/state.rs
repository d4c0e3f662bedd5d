use crate::auth::basic::BasicAuthenticator;
use crate::auth::jwt::{JwtAuthenticator, JwtConfig};
use crate::auth::keys::{InMemoryKeyStore, KeyManager};
use crate::auth::oauth::{OAuthConfig, OAuthIntrospector};
use crate::auth::saml::{AttributeMapping, SamlConfig, SamlProvider};
use crate::auth::Identity;
use crate::config::GatewayConfig;
use crate::control::ControlPlane;
use crate::limiter::{Decision, DistributedWindowLimiter, KeyStrategy, SlidingWindowLimiter};
use crate::metrics::Metrics;
use crate::proxy::route::{build_routes, FeatureRegistries, RouteTable};
use crate::shaping::BotDetector;
use crate::tenant::TenantResolver;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cookie::SameSite;
use http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Service-wide admission limiter, ahead of routing.
pub enum ServiceLimiter {
    Local {
        limiter: SlidingWindowLimiter,
        key: KeyStrategy,
    },
    Redis {
        limiter: DistributedWindowLimiter,
        key: KeyStrategy,
    },
}

impl ServiceLimiter {
    pub async fn allow(
        &self,
        headers: &HeaderMap,
        client_ip: IpAddr,
        identity: Option<&Identity>,
    ) -> Decision {
        match self {
            ServiceLimiter::Local { limiter, key } => {
                limiter.allow(&key.extract(headers, client_ip, identity))
            }
            ServiceLimiter::Redis { limiter, key } => {
                limiter.allow(&key.extract(headers, client_ip, identity)).await
            }
        }
    }
}

/// Pre-route, service-scoped features.
pub struct ServiceFeatures {
    pub limiter: Option<ServiceLimiter>,
    pub bot: Option<BotDetector>,
    pub tenants: TenantResolver,
}

/// The authentication schemes wired up for this deployment. A route lists
/// which of these may satisfy it.
#[derive(Default)]
pub struct AuthSchemes {
    pub api_keys: Option<Arc<KeyManager>>,
    pub saml: Option<Arc<SamlProvider>>,
    pub jwt: Option<Arc<JwtAuthenticator>>,
    pub oauth: Option<Arc<OAuthIntrospector>>,
    pub basic: Option<BasicAuthenticator>,
}

/// Shared gateway state, cheaply cloneable. Request-path lookups are
/// lock-free (`ArcSwap` / registries); construction wires every subsystem
/// and starts their background tasks.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub service: Arc<ServiceFeatures>,
    pub auth: Arc<AuthSchemes>,
    pub registries: Arc<FeatureRegistries>,
    pub control: Arc<ControlPlane>,
    pub metrics: Metrics,
}

impl GatewayState {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let metrics = Metrics::install();

        let registries = Arc::new(FeatureRegistries::new());
        let routes = build_routes(&config, &registries).context("compiling routes")?;

        let service = Arc::new(ServiceFeatures {
            limiter: build_service_limiter(&config).await,
            bot: match &config.service.bot {
                Some(bot) => Some(
                    BotDetector::new(&bot.deny, &bot.allow).context("compiling bot patterns")?,
                ),
                None => None,
            },
            tenants: TenantResolver::new(config.tenants.clone()),
        });

        let auth = Arc::new(build_auth_schemes(&config).await?);

        let control = ControlPlane::new(Duration::from_secs(
            config.control.heartbeat_interval_secs,
        ));
        control.start_sweeper();

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            routes: Arc::new(ArcSwap::new(Arc::new(routes))),
            service,
            auth,
            registries,
            control,
            metrics,
        })
    }

    /// Stop every background task owned by the state's subsystems.
    pub async fn shutdown(&self) {
        self.registries.stop_all().await;
        if let Some(keys) = &self.auth.api_keys {
            keys.stop().await;
        }
        if let Some(saml) = &self.auth.saml {
            saml.stop().await;
        }
        if let Some(jwt) = &self.auth.jwt {
            jwt.stop().await;
        }
        self.control.stop().await;
    }
}

async fn build_service_limiter(config: &GatewayConfig) -> Option<ServiceLimiter> {
    let rl = config.service.rate_limit.as_ref()?;
    let key = KeyStrategy::parse(&rl.key);
    let period = Duration::from_secs(rl.period_secs);

    if rl.mode == "redis" {
        match DistributedWindowLimiter::connect(
            &rl.redis_url,
            rl.redis_key_prefix.clone(),
            rl.rate.max(rl.burst.unwrap_or(0)),
            period,
        )
        .await
        {
            Ok(limiter) => {
                info!("service rate limit: distributed via {}", rl.redis_url);
                return Some(ServiceLimiter::Redis { limiter, key });
            }
            Err(e) => {
                // Availability over strictness: enforce locally rather than
                // refuse to start.
                warn!(
                    "service rate limit: redis unavailable ({}), falling back to local window",
                    e
                );
            }
        }
    }

    Some(ServiceLimiter::Local {
        limiter: SlidingWindowLimiter::new(rl.rate, Some(period), rl.burst),
        key,
    })
}

async fn build_auth_schemes(config: &GatewayConfig) -> Result<AuthSchemes> {
    let mut schemes = AuthSchemes::default();

    if let Some(keys) = &config.auth.api_keys {
        let manager = KeyManager::new(
            Arc::new(InMemoryKeyStore::new()),
            keys.key_length,
            Duration::from_secs(keys.cleanup_interval_secs),
        );
        manager.start_sweeper();
        schemes.api_keys = Some(manager);
        info!("auth: managed API keys enabled");
    }

    if let Some(saml) = &config.auth.saml {
        let signing_key = BASE64
            .decode(saml.signing_key.trim())
            .unwrap_or_else(|_| saml.signing_key.as_bytes().to_vec());
        let provider = SamlProvider::new(SamlConfig {
            sp_entity_id: saml.sp_entity_id.clone(),
            sp_base_url: saml.sp_base_url.clone(),
            path_prefix: saml.path_prefix.clone(),
            idp_sso_url: saml.idp_sso_url.clone(),
            idp_slo_url: saml.idp_slo_url.clone(),
            idp_metadata_url: saml.idp_metadata_url.clone(),
            metadata_refresh_interval: Duration::from_secs(saml.metadata_refresh_secs),
            signing_key,
            session_cookie: saml.session_cookie.clone(),
            session_max_age: Duration::from_secs(saml.session_max_age_secs),
            clock_skew: Duration::from_secs(saml.clock_skew_secs),
            cookie_secure: saml.cookie_secure,
            cookie_same_site: parse_same_site(&saml.cookie_same_site),
            attribute_mapping: saml
                .attributes
                .clone()
                .unwrap_or_else(AttributeMapping::default),
        })
        .context("configuring SAML")?;
        provider.start_metadata_refresh();
        schemes.saml = Some(provider);
        info!("auth: SAML SP enabled");
    }

    if let Some(jwt) = &config.auth.jwt {
        let authenticator = JwtAuthenticator::new(JwtConfig {
            jwks_json: jwt.jwks_json.clone(),
            jwks_url: jwt.jwks_url.clone(),
            refresh_interval: Duration::from_secs(jwt.refresh_secs),
            issuer: jwt.issuer.clone(),
            audience: jwt.audience.clone(),
        })
        .await
        .context("configuring JWT")?;
        authenticator.start_refresh();
        schemes.jwt = Some(authenticator);
        info!("auth: JWT enabled");
    }

    if let Some(oauth) = &config.auth.oauth {
        schemes.oauth = Some(Arc::new(OAuthIntrospector::new(OAuthConfig {
            introspection_url: oauth.introspection_url.clone(),
            client_id: oauth.client_id.clone(),
            client_secret: oauth.client_secret.clone(),
        })));
        info!("auth: OAuth introspection enabled");
    }

    if !config.auth.basic_users.is_empty() {
        schemes.basic = Some(BasicAuthenticator::new(config.auth.basic_users.clone()));
        info!(
            "auth: basic auth enabled, users={}",
            config.auth.basic_users.len()
        );
    }

    Ok(schemes)
}

fn parse_same_site(value: &str) -> SameSite {
    match value {
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Lax,
    }
}
