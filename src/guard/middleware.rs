//! Admission guard wrapped around request handlers.

use http::Response;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::headers::{RateLimitExceeded, RateLimitHeaders};
use crate::config::LimiterConfig;
use crate::error::Result;
use crate::ratelimit::{RateLimitDecision, RateLimiter, RequestIdentity, RequestOutcome};

/// Result of running a handler behind the guard.
#[derive(Debug)]
pub enum GuardResponse<T> {
    /// The handler ran; attach `headers` to its response.
    Admitted {
        headers: RateLimitHeaders,
        response: T,
    },
    /// The handler did not run.
    Rejected(RateLimitExceeded),
}

impl<T> GuardResponse<T> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GuardResponse::Admitted { .. })
    }
}

impl<B: From<String>> GuardResponse<Response<B>> {
    /// Collapse into a single HTTP response carrying the rate limit headers.
    pub fn into_response(self) -> Response<B> {
        match self {
            GuardResponse::Admitted {
                headers,
                mut response,
            } => {
                headers.apply(response.headers_mut());
                response
            }
            GuardResponse::Rejected(exceeded) => exceeded.into_response(),
        }
    }
}

/// Charges each request against its route class before the handler runs and
/// retracts the hit afterwards when the route is configured to skip the
/// handler's outcome.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    decision_timeout: Duration,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, decision_timeout: Duration) -> Self {
        Self {
            limiter,
            decision_timeout,
        }
    }

    pub fn from_config(limiter: Arc<RateLimiter>, config: &LimiterConfig) -> Self {
        Self::new(limiter, config.decision_timeout())
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Make an admission decision within the decision budget.
    ///
    /// If the budget runs out the distributed store is reported unavailable
    /// and the decision is made on the local store instead.
    pub async fn decide(&self, identity: &RequestIdentity, route: &str) -> Result<RateLimitDecision> {
        match tokio::time::timeout(
            self.decision_timeout,
            self.limiter.check_and_consume(identity, route),
        )
        .await
        {
            Ok(decision) => decision,
            Err(_) => {
                warn!(
                    route = %route,
                    budget_ms = self.decision_timeout.as_millis() as u64,
                    "Admission decision exceeded its budget, deciding locally"
                );
                self.limiter
                    .report_store_unavailable("decision budget exceeded");
                self.limiter.check_and_consume_local(identity, route)
            }
        }
    }

    /// Guard an HTTP handler; its response status decides the outcome.
    pub async fn protect<F, Fut, B>(
        &self,
        identity: &RequestIdentity,
        route: &str,
        handler: F,
    ) -> Result<GuardResponse<Response<B>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Response<B>>,
    {
        self.protect_classified(identity, route, handler, |response: &Response<B>| {
            RequestOutcome::from_status(response.status())
        })
        .await
    }

    /// Guard any handler, classifying its output with `classify`.
    pub async fn protect_classified<F, Fut, T, C>(
        &self,
        identity: &RequestIdentity,
        route: &str,
        handler: F,
        classify: C,
    ) -> Result<GuardResponse<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
        C: FnOnce(&T) -> RequestOutcome,
    {
        let decision = self.decide(identity, route).await?;
        let headers = RateLimitHeaders::from_decision(&decision);

        if !decision.allowed {
            return Ok(GuardResponse::Rejected(RateLimitExceeded::from_decision(
                &decision,
            )));
        }

        let response = handler().await;

        if self.limiter.registry().get(route)?.requires_release() {
            let outcome = classify(&response);
            let released = self
                .limiter
                .release(identity, route, decision.token, outcome)
                .await?;
            debug!(route = %route, outcome = ?outcome, released = released, "Handler finished");
        }

        Ok(GuardResponse::Admitted { headers, response })
    }
}
