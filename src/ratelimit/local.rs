//! In-process fixed-window store.
//!
//! Used when the distributed store is unavailable. Each key holds a single
//! counter and reset time, so the window is fixed rather than sliding and a
//! client can get up to roughly twice the limit across a window boundary.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::trace;
use uuid::Uuid;

use super::backend::{StoreKind, WindowHit, WindowLimit, WindowStore};
use crate::error::StoreError;

/// One key's fixed window.
#[derive(Debug)]
struct LocalWindow {
    /// Admitted hits
    count: u64,
    reset_time_ms: u64,
    /// Admitted hits that can still be retracted; empty for routes that
    /// never release
    tokens: HashSet<Uuid>,
}

impl LocalWindow {
    fn open(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 0,
            reset_time_ms: now_ms.saturating_add(window_ms),
            tokens: HashSet::new(),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_time_ms
    }
}

/// Fixed-window counters keyed by rate limit key.
///
/// Updates to one key are serialized by the map's shard lock; keys in other
/// shards proceed in parallel. Memory per key is bounded by the route's
/// limit, not by how hard the key is hit.
#[derive(Debug, Default)]
pub struct LocalStore {
    windows: DashMap<String, LocalWindow>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hit if the window has room.
    ///
    /// A hit at or after the reset time opens a new window. A denied hit
    /// leaves the window untouched and reports `count + 1`.
    pub fn hit(&self, key: &str, token: Uuid, now_ms: u64, limit: WindowLimit) -> WindowHit {
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| LocalWindow::open(now_ms, limit.window_ms));

        if window.is_expired(now_ms) {
            trace!(key = %key, "Local window expired, opening a new one");
            *window = LocalWindow::open(now_ms, limit.window_ms);
        }

        if window.count >= limit.max_requests {
            return WindowHit {
                total_hits: window.count + 1,
                reset_time_ms: window.reset_time_ms,
            };
        }

        window.count += 1;
        if limit.releasable {
            window.tokens.insert(token);
        }

        WindowHit {
            total_hits: window.count,
            reset_time_ms: window.reset_time_ms,
        }
    }

    /// Retract a hit from the current window.
    ///
    /// Tokens from an already expired window, or already released tokens,
    /// are ignored.
    pub fn release(&self, key: &str, token: Uuid, now_ms: u64) -> bool {
        let Some(mut window) = self.windows.get_mut(key) else {
            return false;
        };

        if window.is_expired(now_ms) || !window.tokens.remove(&token) {
            return false;
        }

        window.count = window.count.saturating_sub(1);
        true
    }

    /// Current hit count for a key, zero if its window has elapsed.
    pub fn count(&self, key: &str, now_ms: u64) -> u64 {
        self.windows
            .get(key)
            .filter(|w| !w.is_expired(now_ms))
            .map(|w| w.count)
            .unwrap_or(0)
    }

    /// Drop every window that has elapsed. Returns the number removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now_ms));
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Remove all windows.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.windows.clear();
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    async fn register_hit(
        &self,
        key: &str,
        token: Uuid,
        now_ms: u64,
        limit: WindowLimit,
    ) -> Result<WindowHit, StoreError> {
        Ok(self.hit(key, token, now_ms, limit))
    }

    async fn release_hit(&self, key: &str, token: Uuid, now_ms: u64) -> Result<bool, StoreError> {
        Ok(self.release(key, token, now_ms))
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const WINDOW: u64 = 60_000;

    const LIMIT: WindowLimit = WindowLimit {
        window_ms: WINDOW,
        max_requests: 10_000,
        releasable: true,
    };

    fn limit(max_requests: u64, releasable: bool) -> WindowLimit {
        WindowLimit {
            max_requests,
            releasable,
            ..LIMIT
        }
    }

    fn retained_tokens(store: &LocalStore, key: &str) -> usize {
        store.windows.get(key).map(|w| w.tokens.len()).unwrap_or(0)
    }

    #[test]
    fn test_first_hit_opens_window() {
        let store = LocalStore::new();
        let hit = store.hit("k", Uuid::new_v4(), 1_000, LIMIT);

        assert_eq!(hit.total_hits, 1);
        assert_eq!(hit.reset_time_ms, 61_000);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_hits_accumulate_with_stable_reset() {
        let store = LocalStore::new();
        store.hit("k", Uuid::new_v4(), 1_000, LIMIT);
        store.hit("k", Uuid::new_v4(), 2_000, LIMIT);
        let hit = store.hit("k", Uuid::new_v4(), 30_000, LIMIT);

        assert_eq!(hit.total_hits, 3);
        assert_eq!(hit.reset_time_ms, 61_000);
    }

    #[test]
    fn test_hit_at_reset_time_starts_new_window() {
        let store = LocalStore::new();
        store.hit("k", Uuid::new_v4(), 1_000, LIMIT);
        store.hit("k", Uuid::new_v4(), 60_999, LIMIT);

        let hit = store.hit("k", Uuid::new_v4(), 61_000, LIMIT);
        assert_eq!(hit.total_hits, 1);
        assert_eq!(hit.reset_time_ms, 121_000);
    }

    #[test]
    fn test_denied_hits_are_not_counted() {
        let store = LocalStore::new();
        let tight = limit(2, false);
        store.hit("k", Uuid::new_v4(), 1_000, tight);
        store.hit("k", Uuid::new_v4(), 1_000, tight);

        for now in [2_000, 30_000, 60_999] {
            let hit = store.hit("k", Uuid::new_v4(), now, tight);
            assert_eq!(hit.total_hits, 3);
            assert_eq!(hit.reset_time_ms, 61_000);
            assert!(!hit.admitted(&tight));
        }
        assert_eq!(store.count("k", 60_999), 2);

        let retry = store.hit("k", Uuid::new_v4(), 61_000, tight);
        assert!(retry.admitted(&tight));
        assert_eq!(retry.total_hits, 1);
    }

    #[test]
    fn test_token_retention_is_bounded() {
        let store = LocalStore::new();

        for _ in 0..100_000 {
            store.hit("flood", Uuid::new_v4(), 1_000, limit(100, false));
        }
        assert_eq!(retained_tokens(&store, "flood"), 0);
        assert_eq!(store.count("flood", 1_000), 100);

        for _ in 0..100_000 {
            store.hit("booking", Uuid::new_v4(), 1_000, limit(5, true));
        }
        assert_eq!(retained_tokens(&store, "booking"), 5);
    }

    #[test]
    fn test_release_is_idempotent() {
        let store = LocalStore::new();
        let token = Uuid::new_v4();
        store.hit("k", Uuid::new_v4(), 1_000, LIMIT);
        store.hit("k", token, 1_000, LIMIT);

        assert!(store.release("k", token, 2_000));
        assert!(!store.release("k", token, 2_000));
        assert_eq!(store.count("k", 2_000), 1);
    }

    #[test]
    fn test_release_frees_a_slot() {
        let store = LocalStore::new();
        let tight = limit(1, true);
        let token = Uuid::new_v4();
        store.hit("k", token, 1_000, tight);
        assert!(!store.hit("k", Uuid::new_v4(), 1_000, tight).admitted(&tight));

        assert!(store.release("k", token, 1_500));
        assert!(store.hit("k", Uuid::new_v4(), 1_500, tight).admitted(&tight));
    }

    #[test]
    fn test_release_never_goes_below_zero() {
        let store = LocalStore::new();
        let token = Uuid::new_v4();
        store.hit("k", token, 1_000, LIMIT);

        assert!(store.release("k", token, 1_500));
        assert!(!store.release("k", Uuid::new_v4(), 1_500));
        assert_eq!(store.count("k", 1_500), 0);
    }

    #[test]
    fn test_release_from_previous_window_is_ignored() {
        let store = LocalStore::new();
        let old = Uuid::new_v4();
        store.hit("k", old, 1_000, LIMIT);
        store.hit("k", Uuid::new_v4(), 70_000, LIMIT);

        assert!(!store.release("k", old, 70_500));
        assert_eq!(store.count("k", 70_500), 1);
    }

    #[test]
    fn test_release_unknown_key() {
        let store = LocalStore::new();
        assert!(!store.release("missing", Uuid::new_v4(), 0));
    }

    #[test]
    fn test_sweep_removes_only_expired_windows() {
        let store = LocalStore::new();
        let short = WindowLimit {
            window_ms: 1_000,
            ..LIMIT
        };
        store.hit("old", Uuid::new_v4(), 0, short);
        store.hit("fresh", Uuid::new_v4(), 500, LIMIT);

        assert_eq!(store.sweep(1_000), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.count("fresh", 1_000), 1);
        assert_eq!(store.count("old", 1_000), 0);
    }

    #[test]
    fn test_concurrent_hits_are_not_lost() {
        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.hit("hot", Uuid::new_v4(), 1_000, LIMIT);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.count("hot", 1_000), 2_000);
    }

    #[test]
    fn test_window_store_impl() {
        let store = LocalStore::new();
        let token = Uuid::new_v4();

        let hit = tokio_test::block_on(store.register_hit("k", token, 0, LIMIT)).unwrap();
        assert_eq!(hit.total_hits, 1);
        assert!(tokio_test::block_on(store.release_hit("k", token, 1)).unwrap());
        assert_eq!(store.kind(), StoreKind::Local);
    }
}
