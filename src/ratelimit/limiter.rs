//! Core rate limiter implementation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::backend::{HitToken, StoreKind, WindowHit, WindowStore};
use super::clock::{Clock, SystemClock};
use super::distributed::RedisStore;
use super::health::{HealthState, StoreHealth, StoreRoute};
use super::key::{DefaultKeyGenerator, KeyGenerator, RateLimitKey, RequestIdentity};
use super::local::LocalStore;
use super::metrics::MetricsSink;
use super::rules::{LimitReached, RateLimitConfig, RequestOutcome, RouteRegistry};
use crate::config::GatekeeperConfig;
use crate::error::{Result, StoreError};

/// Default bound on a single distributed store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default time spent on the local store before probing the distributed one again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// The outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// The route class that was charged
    pub route: String,
    /// Whether the request may proceed
    pub allowed: bool,
    /// `max(0, limit - total_hits)`
    pub remaining: u64,
    /// When the budget frees up, epoch milliseconds
    pub reset_time_ms: u64,
    /// Admitted hits in the window plus this one
    pub total_hits: u64,
    /// Configured maximum for the route
    pub limit: u64,
    /// Configured window for the route
    pub window_ms: u64,
    /// Handle for retracting this hit
    pub token: HitToken,
    /// Clock reading the decision was made at
    pub decided_at_ms: u64,
}

impl RateLimitDecision {
    /// The store that recorded the hit.
    pub fn store(&self) -> StoreKind {
        self.token.store
    }

    /// Whole seconds until the budget frees up, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_time_ms
            .saturating_sub(self.decided_at_ms)
            .div_ceil(1000)
    }
}

/// The admission controller.
///
/// Owns the route registry, both window stores and the health state machine
/// that chooses between them. Construct one per process and share it behind
/// an `Arc`; it is safe to use from many tasks at once.
pub struct RateLimiter {
    registry: RouteRegistry,
    key_generator: Arc<dyn KeyGenerator>,
    distributed: Option<Arc<dyn WindowStore>>,
    local: LocalStore,
    health: StoreHealth,
    store_timeout: Duration,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<dyn MetricsSink>>,
    /// Keys whose denial was already reported, with the reset time it was reported for
    blocked: DashMap<String, u64>,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder {
    registry: RouteRegistry,
    key_generator: Arc<dyn KeyGenerator>,
    distributed: Option<Arc<dyn WindowStore>>,
    store_timeout: Duration,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<dyn MetricsSink>>,
    sweep_interval: Option<Duration>,
}

impl RateLimiterBuilder {
    /// Replace the default key generator for routes without their own.
    pub fn key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.key_generator = generator;
        self
    }

    /// Use a shared store; without one the limiter runs local-only.
    pub fn distributed_store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.distributed = Some(store);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Sweep expired local windows this often once [`start`](Self::start)ed.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            registry: self.registry,
            key_generator: self.key_generator,
            distributed: self.distributed,
            local: LocalStore::new(),
            health: StoreHealth::new(self.cooldown.as_millis() as u64),
            store_timeout: self.store_timeout,
            clock: self.clock,
            metrics: self.metrics,
            blocked: DashMap::new(),
        }
    }

    /// Build a shared limiter and spawn its sweeper, if an interval is set.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Arc<RateLimiter> {
        let sweep_interval = self.sweep_interval;
        let limiter = Arc::new(self.build());
        if let Some(interval) = sweep_interval {
            limiter.spawn_sweeper(interval);
            debug!(interval_ms = interval.as_millis() as u64, "Started local window sweeper");
        }
        limiter
    }
}

impl RateLimiter {
    pub fn builder(registry: RouteRegistry) -> RateLimiterBuilder {
        RateLimiterBuilder {
            registry,
            key_generator: Arc::new(DefaultKeyGenerator),
            distributed: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
            clock: Arc::new(SystemClock),
            metrics: None,
            sweep_interval: None,
        }
    }

    /// Build a limiter from process configuration and start sweeping its
    /// local store every `limiter.sweep_interval_secs`.
    ///
    /// The Redis connection is not opened here; if Redis is down when the
    /// first request arrives the limiter simply starts out degraded.
    pub fn start(config: &GatekeeperConfig) -> Result<Arc<Self>> {
        Ok(Self::builder_from_config(config)?.start())
    }

    /// Build a limiter from process configuration without a sweeper.
    ///
    /// Expired local windows are then only reset when their key is hit again
    /// or [`sweep_local`](Self::sweep_local) is called.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        Ok(Self::builder_from_config(config)?.build())
    }

    /// Like [`from_config`](Self::from_config) but leaves the builder open
    /// for a custom clock, key generator or metrics sink.
    pub fn builder_from_config(config: &GatekeeperConfig) -> Result<RateLimiterBuilder> {
        let registry = config.build_registry()?;

        let mut builder = RateLimiter::builder(registry)
            .store_timeout(config.store.timeout())
            .cooldown(config.store.cooldown())
            .sweep_interval(config.limiter.sweep_interval());

        match &config.store.redis_url {
            Some(url) => {
                let store = RedisStore::open(url, config.store.key_prefix.clone())?;
                info!(prefix = %config.store.key_prefix, "Using redis window store");
                builder = builder.distributed_store(Arc::new(store));
            }
            None => {
                info!("No redis_url configured, using local window store only");
            }
        }

        Ok(builder)
    }

    /// Charge one hit to `(identity, route)` and decide whether to admit it.
    ///
    /// Store failures never surface here: they move the limiter to the local
    /// store. The only error is an unknown route class.
    pub async fn check_and_consume(
        &self,
        identity: &RequestIdentity,
        route: &str,
    ) -> Result<RateLimitDecision> {
        let config = self.registry.get(route)?;
        let key = self.key_for(identity, route, config);
        let store_key = key.to_store_key();
        let now_ms = self.clock.now_ms();

        trace!(key = %key, "Checking rate limit");

        if let Some(distributed) = &self.distributed {
            if let StoreRoute::Distributed { probe } = self.health.route(now_ms) {
                let token = HitToken::new(StoreKind::Distributed);
                let result = self
                    .bounded(distributed.register_hit(
                        &store_key,
                        token.id,
                        now_ms,
                        config.window_limit(),
                    ))
                    .await;

                match result {
                    Ok(hit) => {
                        self.health.record_success(self.clock.now_ms(), probe);
                        return Ok(self.decide(route, &key, config, hit, token, now_ms));
                    }
                    Err(err) => {
                        self.health.record_failure(self.clock.now_ms(), probe, &err);
                    }
                }
            }
        }

        Ok(self.consume_local(route, &key, config))
    }

    /// Like [`check_and_consume`](Self::check_and_consume) but never touches
    /// the distributed store.
    pub fn check_and_consume_local(
        &self,
        identity: &RequestIdentity,
        route: &str,
    ) -> Result<RateLimitDecision> {
        let config = self.registry.get(route)?;
        let key = self.key_for(identity, route, config);
        Ok(self.consume_local(route, &key, config))
    }

    /// Retract a hit if `outcome` matches the route's skip settings.
    ///
    /// Returns `true` if a hit was actually removed. Calling this again with
    /// the same token returns `false` and leaves the count alone.
    pub async fn release(
        &self,
        identity: &RequestIdentity,
        route: &str,
        token: HitToken,
        outcome: RequestOutcome,
    ) -> Result<bool> {
        let config = self.registry.get(route)?;
        if !config.should_release(outcome) {
            return Ok(false);
        }

        let key = self.key_for(identity, route, config);
        let store_key = key.to_store_key();
        let now_ms = self.clock.now_ms();

        let released = match (token.store, &self.distributed) {
            (StoreKind::Local, _) => self.local.release(&store_key, token.id, now_ms),
            (StoreKind::Distributed, Some(distributed)) => {
                match self
                    .bounded(distributed.release_hit(&store_key, token.id, now_ms))
                    .await
                {
                    Ok(released) => released,
                    Err(err) => {
                        warn!(key = %key, error = %err, "Failed to release distributed hit");
                        self.health.record_failure(self.clock.now_ms(), false, &err);
                        false
                    }
                }
            }
            (StoreKind::Distributed, None) => false,
        };

        debug!(
            key = %key,
            outcome = ?outcome,
            store = %token.store,
            released = released,
            "Released hit"
        );

        Ok(released)
    }

    /// Force the limiter into degraded mode, e.g. after an outer deadline expired.
    pub fn report_store_unavailable(&self, reason: &str) {
        if self.distributed.is_some() {
            let err = StoreError::unavailable("distributed", reason);
            self.health.record_failure(self.clock.now_ms(), false, &err);
        }
    }

    /// Drop expired local windows now. Returns the number removed.
    pub fn sweep_local(&self) -> usize {
        let now_ms = self.clock.now_ms();
        self.blocked.retain(|_, reset_time_ms| *reset_time_ms > now_ms);
        self.local.sweep(now_ms)
    }

    /// Periodically sweep expired local windows.
    ///
    /// The task holds only a weak reference and ends once the limiter is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep_local();
                if removed > 0 {
                    debug!(removed = removed, "Swept expired local windows");
                }
            }
        })
    }

    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    pub fn store_health(&self) -> &StoreHealth {
        &self.health
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local
    }

    pub fn has_distributed_store(&self) -> bool {
        self.distributed.is_some()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn key_for(
        &self,
        identity: &RequestIdentity,
        route: &str,
        config: &RateLimitConfig,
    ) -> RateLimitKey {
        let generator = config.key_generator.as_ref().unwrap_or(&self.key_generator);
        RateLimitKey::new(route, generator.generate(identity))
    }

    async fn bounded<T, F>(&self, call: F) -> std::result::Result<T, StoreError>
    where
        F: std::future::Future<Output = std::result::Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::timeout("distributed", self.store_timeout)),
        }
    }

    fn consume_local(
        &self,
        route: &str,
        key: &RateLimitKey,
        config: &RateLimitConfig,
    ) -> RateLimitDecision {
        let now_ms = self.clock.now_ms();
        let token = HitToken::new(StoreKind::Local);
        let hit = self
            .local
            .hit(&key.to_store_key(), token.id, now_ms, config.window_limit());
        self.decide(route, key, config, hit, token, now_ms)
    }

    fn first_denial(&self, key: &RateLimitKey, reset_time_ms: u64, now_ms: u64) -> bool {
        match self.blocked.entry(key.to_store_key()) {
            Entry::Occupied(mut reported) => {
                let first = now_ms >= *reported.get();
                reported.insert(reset_time_ms);
                first
            }
            Entry::Vacant(slot) => {
                slot.insert(reset_time_ms);
                true
            }
        }
    }

    fn decide(
        &self,
        route: &str,
        key: &RateLimitKey,
        config: &RateLimitConfig,
        hit: WindowHit,
        token: HitToken,
        now_ms: u64,
    ) -> RateLimitDecision {
        let allowed = hit.admitted(&config.window_limit());

        if !allowed {
            // Only the first denial until the reported reset is logged loudly.
            if self.first_denial(key, hit.reset_time_ms, now_ms) {
                info!(
                    route = %route,
                    key = %key,
                    total_hits = hit.total_hits,
                    limit = config.max_requests,
                    store = %token.store,
                    "Rate limit exceeded"
                );
                if let Some(hook) = &config.on_limit_reached {
                    hook(&LimitReached {
                        route: route.to_string(),
                        key: key.to_string(),
                        total_hits: hit.total_hits,
                        limit: config.max_requests,
                        reset_time_ms: hit.reset_time_ms,
                    });
                }
            } else {
                debug!(
                    key = %key,
                    total_hits = hit.total_hits,
                    "Rate limit exceeded"
                );
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_decision(route, allowed, token.store);
        }

        RateLimitDecision {
            route: route.to_string(),
            allowed,
            remaining: config.max_requests.saturating_sub(hit.total_hits),
            reset_time_ms: hit.reset_time_ms,
            total_hits: hit.total_hits,
            limit: config.max_requests,
            window_ms: config.window_ms,
            token,
            decided_at_ms: now_ms,
        }
    }
}
