pub mod types;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. A missing file means
    /// built-in defaults — the gateway starts with zero configuration for
    /// local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config loaded, routes={}, tenants={}",
            config.routes.len(),
            config.tenants.len()
        );
        Ok(config)
    }

    /// Environment overrides for connection/infra settings. Route and tenant
    /// config comes only from the file (or a control-plane push).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RUNWAY_REDIS_URL") {
            if let Some(rl) = &mut self.service.rate_limit {
                rl.redis_url = v;
            }
        }
        if let Ok(v) = std::env::var("RUNWAY_CONTROL_HEARTBEAT_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.control.heartbeat_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("RUNWAY_SAML_SIGNING_KEY") {
            if let Some(saml) = &mut self.auth.saml {
                saml.signing_key = v;
            }
        }
        if let Ok(v) = std::env::var("RUNWAY_OAUTH_CLIENT_SECRET") {
            if let Some(oauth) = &mut self.auth.oauth {
                oauth.client_secret = v;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route id cannot be empty");
            }
            if !seen.insert(route.id.as_str()) {
                anyhow::bail!("duplicate route id {:?}", route.id);
            }
            if !route.path_prefix.starts_with('/') {
                anyhow::bail!(
                    "route {:?}: path_prefix must start with '/', got {:?}",
                    route.id,
                    route.path_prefix
                );
            }
            for scheme in &route.auth {
                match scheme.as_str() {
                    "api_key" | "saml" | "jwt" | "oauth" | "basic" => {}
                    other => anyhow::bail!("route {:?}: unknown auth scheme {:?}", route.id, other),
                }
            }
        }
        if let Some(rl) = &self.service.rate_limit {
            if rl.mode != "local" && rl.mode != "redis" {
                anyhow::bail!("service rate_limit mode must be \"local\" or \"redis\"");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, path: &str) -> RouteConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "path_prefix": path,
            "handler": {"kind": "mock"},
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_basic_config() {
        let config = GatewayConfig {
            routes: vec![route("a", "/a"), route("b", "/b")],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = GatewayConfig {
            routes: vec![route("a", "/a"), route("a", "/b")],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_prefix() {
        let config = GatewayConfig {
            routes: vec![route("a", "api")],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_scheme() {
        let mut bad = route("a", "/a");
        bad.auth = vec!["kerberos".into()];
        let config = GatewayConfig {
            routes: vec![bad],
            ..GatewayConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_defaults() {
        let config = GatewayConfig::load(Path::new("/nonexistent/runway.toml")).unwrap();
        assert!(config.routes.is_empty());
    }
}
