//! Client key generation and route scoping.

use std::fmt;
use std::net::IpAddr;

use sha2::{Digest, Sha256};

/// Number of hash bytes kept for anonymous client keys.
const ANON_HASH_BYTES: usize = 8;

/// What the limiter knows about the client behind a request.
///
/// Resolved by the surrounding application (session lookup, proxy headers)
/// before the limiter is consulted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Authenticated user id, if the session resolved one
    pub user_id: Option<String>,
    /// Remote address of the client
    pub ip: Option<IpAddr>,
    /// Raw User-Agent header
    pub user_agent: Option<String>,
}

impl RequestIdentity {
    pub fn anonymous(ip: Option<IpAddr>, user_agent: Option<&str>) -> Self {
        Self {
            user_id: None,
            ip,
            user_agent: user_agent.map(str::to_string),
        }
    }

    pub fn authenticated(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Derives the per-client part of a rate limit key.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, identity: &RequestIdentity) -> String;
}

impl<F> KeyGenerator for F
where
    F: Fn(&RequestIdentity) -> String + Send + Sync,
{
    fn generate(&self, identity: &RequestIdentity) -> String {
        self(identity)
    }
}

/// The default key generator.
///
/// Authenticated clients are keyed by user id. Anonymous clients are keyed by
/// a short hash of IP address and User-Agent, which is stable across processes
/// but makes no attempt at collision resistance beyond fair bucketing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyGenerator;

impl KeyGenerator for DefaultKeyGenerator {
    fn generate(&self, identity: &RequestIdentity) -> String {
        match identity.user_id.as_deref() {
            Some(id) if !id.is_empty() => format!("user:{}", id),
            _ => format!("anon:{}", anonymous_fingerprint(identity)),
        }
    }
}

fn anonymous_fingerprint(identity: &RequestIdentity) -> String {
    let ip = identity
        .ip
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = identity.user_agent.as_deref().unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    let digest = hasher.finalize();

    hex::encode(&digest[..ANON_HASH_BYTES])
}

/// A client key scoped to one route class.
///
/// Two route classes never share a budget, even for the same client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// The route class this key is charged against
    pub route: String,
    /// The per-client key produced by a [`KeyGenerator`]
    pub client: String,
}

impl RateLimitKey {
    pub fn new(route: &str, client: String) -> Self {
        Self {
            route: route.to_string(),
            client,
        }
    }

    /// The storage key, `{route}:{client}`.
    pub fn to_store_key(&self) -> String {
        format!("{}:{}", self.route, self.client)
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.client)
    }
}
