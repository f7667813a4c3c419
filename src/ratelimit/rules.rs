//! Route class rate limit rules.
//!
//! The registry maps each route class to an immutable [`RateLimitConfig`].
//! It starts from the built-in table, applies operator overrides, and is
//! validated once; afterwards it is never mutated.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::backend::WindowLimit;
use super::key::KeyGenerator;
use crate::error::{GatekeeperError, Result};

/// Callback invoked when a key first exceeds its limit within a window.
pub type LimitReachedHook = Arc<dyn Fn(&LimitReached) + Send + Sync>;

/// Details passed to a [`LimitReachedHook`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitReached {
    pub route: String,
    pub key: String,
    pub total_hits: u64,
    pub limit: u64,
    pub reset_time_ms: u64,
}

/// How a protected operation ended, for reversible accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Success,
    Failure,
}

impl RequestOutcome {
    /// Classify an HTTP status: anything below 400 counts as success.
    pub fn from_status(status: http::StatusCode) -> Self {
        if status.as_u16() < 400 {
            RequestOutcome::Success
        } else {
            RequestOutcome::Failure
        }
    }
}

/// Rate limit parameters for one route class.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum hits admitted per window
    pub max_requests: u64,
    /// Retract hits whose operation succeeded
    pub skip_successful_requests: bool,
    /// Retract hits whose operation failed
    pub skip_failed_requests: bool,
    /// Overrides the limiter's default key generator for this route
    pub key_generator: Option<Arc<dyn KeyGenerator>>,
    /// Called when a key first crosses its limit in a window
    pub on_limit_reached: Option<LimitReachedHook>,
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("custom_key_generator", &self.key_generator.is_some())
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            max_requests,
            skip_successful_requests: false,
            skip_failed_requests: false,
            key_generator: None,
            on_limit_reached: None,
        }
    }

    pub fn skip_successful(mut self) -> Self {
        self.skip_successful_requests = true;
        self
    }

    pub fn skip_failed(mut self) -> Self {
        self.skip_failed_requests = true;
        self
    }

    pub fn with_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = Some(generator);
        self
    }

    pub fn on_limit_reached(mut self, hook: LimitReachedHook) -> Self {
        self.on_limit_reached = Some(hook);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The budget handed to a window store.
    pub fn window_limit(&self) -> WindowLimit {
        WindowLimit {
            window_ms: self.window_ms,
            max_requests: self.max_requests,
            releasable: self.requires_release(),
        }
    }

    /// Whether callers must report the outcome of admitted requests.
    pub fn requires_release(&self) -> bool {
        self.skip_successful_requests || self.skip_failed_requests
    }

    /// Whether a hit with this outcome should be retracted.
    pub fn should_release(&self, outcome: RequestOutcome) -> bool {
        match outcome {
            RequestOutcome::Success => self.skip_successful_requests,
            RequestOutcome::Failure => self.skip_failed_requests,
        }
    }

    fn validate(&self, route: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GatekeeperError::Config(format!(
                "route '{}': max_requests must be positive",
                route
            )));
        }
        if self.window_ms == 0 {
            return Err(GatekeeperError::Config(format!(
                "route '{}': window_ms must be positive",
                route
            )));
        }
        Ok(())
    }

    fn apply(&mut self, rule: &RouteOverride) {
        if let Some(window_ms) = rule.window_ms {
            self.window_ms = window_ms;
        }
        if let Some(max_requests) = rule.max_requests {
            self.max_requests = max_requests;
        }
        if let Some(skip) = rule.skip_successful_requests {
            self.skip_successful_requests = skip;
        }
        if let Some(skip) = rule.skip_failed_requests {
            self.skip_failed_requests = skip;
        }
    }
}

/// Operator-supplied adjustments for a route class.
///
/// For a built-in route, unset fields keep the built-in value. A route that is
/// not built in must set both `window_ms` and `max_requests`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteOverride {
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub skip_successful_requests: Option<bool>,
    #[serde(default)]
    pub skip_failed_requests: Option<bool>,
}

/// YAML layout for a standalone routes file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutesFile {
    #[serde(default)]
    pub routes: HashMap<String, RouteOverride>,
}

/// The built-in route classes and their budgets.
pub fn builtin_routes() -> Vec<(&'static str, RateLimitConfig)> {
    vec![
        ("search", RateLimitConfig::new(100, Duration::from_secs(60))),
        (
            "booking",
            RateLimitConfig::new(10, Duration::from_secs(300)).skip_successful(),
        ),
        (
            "auth",
            RateLimitConfig::new(5, Duration::from_secs(900)).skip_successful(),
        ),
        (
            "api",
            RateLimitConfig::new(1000, Duration::from_secs(60)).skip_successful(),
        ),
        ("upload", RateLimitConfig::new(20, Duration::from_secs(300))),
        (
            "admin",
            RateLimitConfig::new(200, Duration::from_secs(60)).skip_successful(),
        ),
    ]
}

/// Immutable route class → config table.
#[derive(Debug, Clone)]
pub struct RouteRegistry {
    routes: HashMap<String, Arc<RateLimitConfig>>,
}

impl RouteRegistry {
    pub fn builder() -> RouteRegistryBuilder {
        RouteRegistryBuilder::default()
    }

    /// The built-in table with no overrides.
    pub fn builtin() -> Self {
        let routes = builtin_routes()
            .into_iter()
            .map(|(name, config)| (name.to_string(), Arc::new(config)))
            .collect();
        Self { routes }
    }

    /// Look up the config for a route class.
    ///
    /// An unknown route class is a configuration error, never a default.
    pub fn get(&self, route: &str) -> Result<&Arc<RateLimitConfig>> {
        self.routes
            .get(route)
            .ok_or_else(|| GatekeeperError::UnknownRoute(route.to_string()))
    }

    pub fn contains(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Routes in name order.
    pub fn routes(&self) -> BTreeMap<&str, &Arc<RateLimitConfig>> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v)).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Builds and validates a [`RouteRegistry`].
#[derive(Default)]
pub struct RouteRegistryBuilder {
    routes: HashMap<String, RateLimitConfig>,
    errors: Vec<GatekeeperError>,
}

impl RouteRegistryBuilder {
    pub fn with_builtin_routes(mut self) -> Self {
        for (name, config) in builtin_routes() {
            self.routes.insert(name.to_string(), config);
        }
        self
    }

    /// Add or replace a route class.
    pub fn route(mut self, name: impl Into<String>, config: RateLimitConfig) -> Self {
        self.routes.insert(name.into(), config);
        self
    }

    /// Apply overrides on top of the routes registered so far.
    pub fn overrides(mut self, overrides: &HashMap<String, RouteOverride>) -> Self {
        for (name, rule) in overrides {
            match self.routes.get_mut(name) {
                Some(config) => config.apply(rule),
                None => match (rule.window_ms, rule.max_requests) {
                    (Some(window_ms), Some(max_requests)) => {
                        let mut config =
                            RateLimitConfig::new(max_requests, Duration::from_millis(window_ms));
                        config.apply(rule);
                        self.routes.insert(name.clone(), config);
                    }
                    _ => self.errors.push(GatekeeperError::Config(format!(
                        "route '{}' is not built in and must set window_ms and max_requests",
                        name
                    ))),
                },
            }
        }
        self
    }

    /// Install a custom key generator on an already registered route.
    pub fn key_generator(mut self, route: &str, generator: Arc<dyn KeyGenerator>) -> Self {
        match self.routes.get_mut(route) {
            Some(config) => config.key_generator = Some(generator),
            None => self
                .errors
                .push(GatekeeperError::UnknownRoute(route.to_string())),
        }
        self
    }

    /// Install a limit-reached hook on an already registered route.
    pub fn on_limit_reached(mut self, route: &str, hook: LimitReachedHook) -> Self {
        match self.routes.get_mut(route) {
            Some(config) => config.on_limit_reached = Some(hook),
            None => self
                .errors
                .push(GatekeeperError::UnknownRoute(route.to_string())),
        }
        self
    }

    pub fn build(mut self) -> Result<RouteRegistry> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        for (name, config) in &self.routes {
            validate_route_name(name)?;
            config.validate(name)?;
        }

        info!(routes = self.routes.len(), "Route registry loaded");

        Ok(RouteRegistry {
            routes: self
                .routes
                .into_iter()
                .map(|(name, config)| (name, Arc::new(config)))
                .collect(),
        })
    }
}

fn validate_route_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(GatekeeperError::Config(format!(
            "invalid route class name '{}'",
            name
        )))
    }
}

impl RoutesFile {
    /// Parse route overrides from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse routes: {}", e)))
    }
}
