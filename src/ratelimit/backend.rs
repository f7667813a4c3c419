//! Window store trait for abstracting distributed and local implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::StoreError;

/// Which backend recorded a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Shared sorted-set store
    Distributed,
    /// In-process fallback
    Local,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Distributed => "distributed",
            StoreKind::Local => "local",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one recorded hit so it can later be retracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HitToken {
    pub id: Uuid,
    pub store: StoreKind,
}

impl HitToken {
    pub fn new(store: StoreKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            store,
        }
    }
}

/// The budget a hit is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimit {
    pub window_ms: u64,
    pub max_requests: u64,
    /// Keep the hit's token so the hit can be released later
    pub releasable: bool,
}

/// State of a key's window right after a hit was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Admitted hits in the window plus the one just attempted
    pub total_hits: u64,
    /// When a slot frees up, epoch milliseconds
    pub reset_time_ms: u64,
}

impl WindowHit {
    pub fn admitted(&self, limit: &WindowLimit) -> bool {
        self.total_hits <= limit.max_requests
    }
}

/// Storage for per-key hit windows.
///
/// Implementations prune expired hits, then record the new one only if the
/// window has room, and report the resulting count in one call. Denied hits
/// are never stored, so a client that waits until `reset_time_ms` is
/// admitted again. Windows are half-open: a hit recorded at `t` stops
/// counting at `t + window_ms`.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Try to record a hit identified by `token` at `now_ms`.
    async fn register_hit(
        &self,
        key: &str,
        token: Uuid,
        now_ms: u64,
        limit: WindowLimit,
    ) -> Result<WindowHit, StoreError>;

    /// Retract a previously registered hit.
    ///
    /// Returns `true` only the first time a live hit is removed.
    async fn release_hit(&self, key: &str, token: Uuid, now_ms: u64) -> Result<bool, StoreError>;

    fn kind(&self) -> StoreKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = HitToken::new(StoreKind::Local);
        let b = HitToken::new(StoreKind::Local);
        assert_ne!(a, b);
        assert_eq!(a.store, StoreKind::Local);
    }

    #[test]
    fn test_admitted_up_to_limit() {
        let limit = WindowLimit {
            window_ms: 1_000,
            max_requests: 2,
            releasable: false,
        };
        let hit = |total_hits| WindowHit {
            total_hits,
            reset_time_ms: 1_000,
        };
        assert!(hit(2).admitted(&limit));
        assert!(!hit(3).admitted(&limit));
    }

    #[test]
    fn test_store_kind_serializes_lowercase() {
        let json = serde_json::to_string(&StoreKind::Distributed).unwrap();
        assert_eq!(json, "\"distributed\"");
        assert_eq!(StoreKind::Local.to_string(), "local");
    }
}
