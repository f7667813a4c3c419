//! Decision counters per route class.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::backend::StoreKind;

/// Receives one event per admission decision.
pub trait MetricsSink: Send + Sync {
    fn record_decision(&self, route: &str, allowed: bool, store: StoreKind);
}

#[derive(Debug, Default)]
struct RouteCounters {
    admitted: AtomicU64,
    denied: AtomicU64,
    local: AtomicU64,
}

/// Snapshot of one route's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouteCounts {
    pub admitted: u64,
    pub denied: u64,
    /// Decisions served by the local fallback store
    pub local: u64,
}

/// In-memory [`MetricsSink`] keeping admitted/denied counts per route.
#[derive(Debug, Default)]
pub struct DecisionCounters {
    routes: DashMap<String, RouteCounters>,
}

impl DecisionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, route: &str) -> RouteCounts {
        self.routes
            .get(route)
            .map(|c| snapshot(&c))
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, RouteCounts> {
        self.routes
            .iter()
            .map(|entry| (entry.key().clone(), snapshot(entry.value())))
            .collect()
    }
}

fn snapshot(counters: &RouteCounters) -> RouteCounts {
    RouteCounts {
        admitted: counters.admitted.load(Ordering::Relaxed),
        denied: counters.denied.load(Ordering::Relaxed),
        local: counters.local.load(Ordering::Relaxed),
    }
}

impl MetricsSink for DecisionCounters {
    fn record_decision(&self, route: &str, allowed: bool, store: StoreKind) {
        if !self.routes.contains_key(route) {
            self.routes.entry(route.to_string()).or_default();
        }
        let Some(counters) = self.routes.get(route) else {
            return;
        };
        if allowed {
            counters.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        if store == StoreKind::Local {
            counters.local.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_route() {
        let counters = DecisionCounters::new();
        counters.record_decision("search", true, StoreKind::Distributed);
        counters.record_decision("search", false, StoreKind::Local);
        counters.record_decision("auth", true, StoreKind::Local);

        assert_eq!(
            counters.get("search"),
            RouteCounts {
                admitted: 1,
                denied: 1,
                local: 1
            }
        );
        assert_eq!(counters.get("auth").admitted, 1);
        assert_eq!(counters.get("upload"), RouteCounts::default());
        assert_eq!(counters.snapshot().len(), 2);
    }
}
