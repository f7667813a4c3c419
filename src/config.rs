//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{RouteOverride, RouteRegistry, DEFAULT_KEY_PREFIX};

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for a Gatekeeper process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-route overrides of the built-in table, or new routes
    #[serde(default)]
    pub routes: HashMap<String, RouteOverride>,
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one the limiter runs on the local store only
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Namespace for keys in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single distributed store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Time spent degraded before probing Redis again, in milliseconds
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
            cooldown_ms: default_cooldown(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_cooldown() -> u64 {
    30_000
}

/// Limiter behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Upper bound on one admission decision, in milliseconds
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,

    /// How often expired local windows are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            decision_timeout_ms: default_decision_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl LimiterConfig {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_decision_timeout() -> u64 {
    3_000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional YAML file plus environment overrides.
    ///
    /// Environment variables use the `GATEKEEPER` prefix and `__` as the
    /// nesting separator, e.g. `GATEKEEPER__STORE__REDIS_URL`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::with_name(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: GatekeeperConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("store.timeout_ms", self.store.timeout_ms),
            ("store.cooldown_ms", self.store.cooldown_ms),
            ("limiter.decision_timeout_ms", self.limiter.decision_timeout_ms),
            ("limiter.sweep_interval_secs", self.limiter.sweep_interval_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(GatekeeperError::Config(format!("{} must be positive", name)));
            }
        }

        if self.limiter.decision_timeout_ms < self.store.timeout_ms {
            return Err(GatekeeperError::Config(format!(
                "limiter.decision_timeout_ms ({}) must not be shorter than store.timeout_ms ({})",
                self.limiter.decision_timeout_ms, self.store.timeout_ms
            )));
        }

        if self.store.key_prefix.is_empty() {
            return Err(GatekeeperError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the route table: built-in routes with overrides applied.
    pub fn build_registry(&self) -> Result<RouteRegistry> {
        RouteRegistry::builder()
            .with_builtin_routes()
            .overrides(&self.routes)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatekeeperConfig::default();
        config.validate().unwrap();
        assert_eq!(config.store.redis_url, None);
        assert_eq!(config.store.key_prefix, "gatekeeper");
        assert_eq!(config.store.timeout(), Duration::from_secs(2));
        assert_eq!(config.limiter.decision_timeout(), Duration::from_secs(3));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_yaml() {
        let config = GatekeeperConfig::from_yaml(
            r#"
store:
  redis_url: redis://cache:6379/
  timeout_ms: 500
limiter:
  decision_timeout_ms: 800
logging:
  json: true
routes:
  search:
    max_requests: 50
  reports:
    window_ms: 3600000
    max_requests: 12
"#,
        )
        .unwrap();

        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379/"));
        assert_eq!(config.store.cooldown_ms, 30_000);
        assert!(config.logging.json);

        let registry = config.build_registry().unwrap();
        assert_eq!(registry.get("search").unwrap().max_requests, 50);
        assert_eq!(registry.get("search").unwrap().window_ms, 60_000);
        assert_eq!(registry.get("reports").unwrap().max_requests, 12);
        assert_eq!(registry.len(), 7);
    }

    #[test]
    fn test_decision_timeout_shorter_than_store_timeout() {
        let result = GatekeeperConfig::from_yaml(
            r#"
store:
  timeout_ms: 5000
limiter:
  decision_timeout_ms: 1000
"#,
        );
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }

    #[test]
    fn test_zero_cooldown_rejected() {
        let mut config = GatekeeperConfig::default();
        config.store.cooldown_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_route_override_fails_registry() {
        let config = GatekeeperConfig::from_yaml(
            r#"
routes:
  upload:
    max_requests: 0
"#,
        )
        .unwrap();
        let err = config.build_registry().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("gatekeeper-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "store:\n  key_prefix: edge\nroutes:\n  auth:\n    max_requests: 3").unwrap();

        let config = GatekeeperConfig::load(path.to_str()).unwrap();
        assert_eq!(config.store.key_prefix, "edge");
        assert_eq!(config.routes["auth"].max_requests, Some(3));

        let same = GatekeeperConfig::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(same.store.key_prefix, "edge");

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = GatekeeperConfig::load(Some("/nonexistent/gatekeeper.yaml")).unwrap_err();
        assert!(err.is_configuration());
    }
}
