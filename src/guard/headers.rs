//! Rate limit response headers and the 429 rejection.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::RateLimitDecision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_WINDOW: HeaderName = HeaderName::from_static("x-ratelimit-window");

/// Header values attached to every decision, allowed or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Reset time in epoch seconds, rounded up
    pub reset_epoch_secs: u64,
    pub window_secs: u64,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_epoch_secs: decision.reset_time_ms.div_ceil(1000),
            window_secs: decision.window_ms / 1000,
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs));
        headers.insert(X_RATELIMIT_WINDOW, HeaderValue::from(self.window_secs));
    }
}

/// A denied request.
///
/// The message is safe to show to clients; it carries no store details.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("too many requests, retry after {retry_after_secs} seconds")]
pub struct RateLimitExceeded {
    pub route: String,
    pub retry_after_secs: u64,
    pub headers: RateLimitHeaders,
}

impl RateLimitExceeded {
    pub fn from_decision(decision: &RateLimitDecision) -> Self {
        Self {
            route: decision.route.clone(),
            retry_after_secs: decision.retry_after_secs(),
            headers: RateLimitHeaders::from_decision(decision),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::TOO_MANY_REQUESTS
    }

    /// Render as a 429 response with `Retry-After` and the rate limit headers.
    pub fn into_response<B: From<String>>(self) -> Response<B> {
        let mut response = Response::new(B::from(self.to_string()));
        *response.status_mut() = self.status();
        let headers = response.headers_mut();
        self.headers.apply(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{HitToken, StoreKind};

    fn denied() -> RateLimitDecision {
        RateLimitDecision {
            route: "auth".to_string(),
            allowed: false,
            remaining: 0,
            reset_time_ms: 1_700_000_900_500,
            total_hits: 6,
            limit: 5,
            window_ms: 900_000,
            token: HitToken::new(StoreKind::Distributed),
            decided_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_headers_from_decision() {
        let headers = RateLimitHeaders::from_decision(&denied());
        assert_eq!(headers.limit, 5);
        assert_eq!(headers.remaining, 0);
        assert_eq!(headers.reset_epoch_secs, 1_700_000_901);
        assert_eq!(headers.window_secs, 900);

        let mut map = HeaderMap::new();
        headers.apply(&mut map);
        assert_eq!(map["x-ratelimit-limit"], "5");
        assert_eq!(map["x-ratelimit-remaining"], "0");
        assert_eq!(map["x-ratelimit-reset"], "1700000901");
        assert_eq!(map["x-ratelimit-window"], "900");
    }

    #[test]
    fn test_exceeded_response() {
        let exceeded = RateLimitExceeded::from_decision(&denied());
        assert_eq!(exceeded.retry_after_secs, 901);
        assert_eq!(
            exceeded.to_string(),
            "too many requests, retry after 901 seconds"
        );

        let response: Response<String> = exceeded.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "901");
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert!(!response.body().contains("redis"));
    }
}
