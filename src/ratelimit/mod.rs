//! Rate limiting logic and state management.

mod backend;
mod clock;
mod distributed;
mod health;
mod key;
mod limiter;
mod local;
mod metrics;
mod rules;

pub use backend::{HitToken, StoreKind, WindowHit, WindowLimit, WindowStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{RedisStore, DEFAULT_KEY_PREFIX};
pub use health::{HealthState, StoreHealth, StoreRoute};
pub use key::{DefaultKeyGenerator, KeyGenerator, RateLimitKey, RequestIdentity};
pub use limiter::{
    RateLimitDecision, RateLimiter, RateLimiterBuilder, DEFAULT_COOLDOWN, DEFAULT_STORE_TIMEOUT,
};
pub use local::LocalStore;
pub use metrics::{DecisionCounters, MetricsSink, RouteCounts};
pub use rules::{
    builtin_routes, LimitReached, LimitReachedHook, RateLimitConfig, RequestOutcome,
    RouteOverride, RouteRegistry, RouteRegistryBuilder, RoutesFile,
};

#[cfg(test)]
pub(crate) use limiter::tests as limiter_tests;
