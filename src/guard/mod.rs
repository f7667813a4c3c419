//! HTTP-facing admission guard.

mod headers;
mod middleware;

pub use headers::{
    RateLimitExceeded, RateLimitHeaders, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET, X_RATELIMIT_WINDOW,
};
pub use middleware::{GuardResponse, RateLimitGuard};
