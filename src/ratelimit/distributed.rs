//! Distributed sliding-window store backed by Redis sorted sets.
//!
//! Each key is a sorted set whose members are tokens of admitted hits,
//! scored by hit time. A hit runs one Lua script that prunes expired
//! members, counts the rest, and adds itself only if the window has room.
//! Redis runs scripts atomically, so concurrent hits on the same key from
//! different processes cannot interleave.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use uuid::Uuid;

use super::backend::{StoreKind, WindowHit, WindowLimit, WindowStore};
use crate::error::{GatekeeperError, StoreError};

/// Default namespace for rate limit keys in Redis.
pub const DEFAULT_KEY_PREFIX: &str = "gatekeeper";

/// Returns `{total_hits, blocking_score, admitted}`.
///
/// When denied, `blocking_score` is the score of the member whose expiry
/// brings the count back under the limit.
const ADMIT_SCRIPT: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", key, "-inf", now_ms - window_ms)
local count = redis.call("ZCARD", key)

if count < limit then
    redis.call("ZADD", key, now_ms, member)
    redis.call("PEXPIRE", key, window_ms)
    local oldest = redis.call("ZRANGE", key, 0, 0, "WITHSCORES")
    return {count + 1, tonumber(oldest[2]), 1}
end

local index = count - limit
local blocking = redis.call("ZRANGE", key, index, index, "WITHSCORES")
return {count + 1, tonumber(blocking[2]) or now_ms, 0}
"#;

/// A window store shared by every process pointing at the same Redis.
///
/// The connection manager is created on first use and then reused by all
/// requests; it reconnects on its own after transient failures.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    admit: redis::Script,
    prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the given Redis URL.
    ///
    /// Only the URL is validated here; no connection is made until the first hit.
    pub fn open(url: &str, prefix: impl Into<String>) -> Result<Self, GatekeeperError> {
        let client = redis::Client::open(url)
            .map_err(|e| GatekeeperError::Config(format!("invalid redis url: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            admit: redis::Script::new(ADMIT_SCRIPT),
            prefix: prefix.into(),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                debug!(prefix = %self.prefix, "Connecting to redis");
                self.client.get_connection_manager().await
            })
            .await?;
        Ok(connection.clone())
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Number of admitted hits currently stored for a key.
    pub async fn count(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64, StoreError> {
        let mut connection = self.connection().await?;
        let count: u64 = connection
            .zcount(
                self.redis_key(key),
                format!("({}", prune_threshold(now_ms, window_ms)),
                "+inf",
            )
            .await?;
        Ok(count)
    }
}

/// Scores at or below this value have left the window.
fn prune_threshold(now_ms: u64, window_ms: u64) -> u64 {
    now_ms.saturating_sub(window_ms)
}

/// A slot frees up when the blocking hit leaves the window.
fn reset_time(blocking_score: u64, window_ms: u64) -> u64 {
    blocking_score.saturating_add(window_ms)
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn register_hit(
        &self,
        key: &str,
        token: Uuid,
        now_ms: u64,
        limit: WindowLimit,
    ) -> Result<WindowHit, StoreError> {
        let redis_key = self.redis_key(key);
        let mut connection = self.connection().await?;

        let (total_hits, blocking_score, admitted): (u64, u64, u8) = self
            .admit
            .key(&redis_key)
            .arg(now_ms)
            .arg(limit.window_ms)
            .arg(limit.max_requests)
            .arg(token.to_string())
            .invoke_async(&mut connection)
            .await?;

        let reset_time_ms = reset_time(blocking_score, limit.window_ms);

        trace!(
            key = %redis_key,
            total_hits = total_hits,
            admitted = admitted == 1,
            reset_time_ms = reset_time_ms,
            "Registered distributed hit"
        );

        Ok(WindowHit {
            total_hits,
            reset_time_ms,
        })
    }

    async fn release_hit(&self, key: &str, token: Uuid, _now_ms: u64) -> Result<bool, StoreError> {
        let mut connection = self.connection().await?;
        let removed: u64 = connection
            .zrem(self.redis_key(key), token.to_string())
            .await?;
        Ok(removed > 0)
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Distributed
    }
}
