//! Healthy/Degraded state machine for the distributed store.
//!
//! While Healthy every decision goes to the distributed store. The first
//! failure moves the limiter to Degraded: decisions use the local store and
//! the distributed store is left alone until a cooldown elapses. After that a
//! single request is allowed through as a probe; its success restores
//! Healthy, its failure restarts the cooldown.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// Externally visible health of the distributed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
}

/// Where the next decision should be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRoute {
    /// Use the distributed store; `probe` marks a recovery attempt.
    Distributed { probe: bool },
    Local,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Healthy,
    Degraded {
        since_ms: u64,
        retry_at_ms: u64,
        /// Start time of the in-flight probe, if any
        probe_started_ms: Option<u64>,
    },
}

/// Tracks distributed store health for one limiter instance.
#[derive(Debug)]
pub struct StoreHealth {
    state: Mutex<State>,
    cooldown_ms: u64,
    downgrades: AtomicU64,
    recoveries: AtomicU64,
}

impl StoreHealth {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            state: Mutex::new(State::Healthy),
            cooldown_ms,
            downgrades: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> HealthState {
        match *self.state.lock() {
            State::Healthy => HealthState::Healthy,
            State::Degraded { .. } => HealthState::Degraded,
        }
    }

    /// Decide which store serves the next request.
    ///
    /// At most one probe is in flight at a time. A probe that never reports
    /// back (its request was cancelled) is superseded after another cooldown.
    pub fn route(&self, now_ms: u64) -> StoreRoute {
        let mut state = self.state.lock();
        let current = *state;
        match current {
            State::Healthy => StoreRoute::Distributed { probe: false },
            State::Degraded {
                since_ms,
                retry_at_ms,
                probe_started_ms,
            } => {
                if now_ms < retry_at_ms {
                    return StoreRoute::Local;
                }
                let probe_stale = probe_started_ms
                    .map(|started| now_ms >= started.saturating_add(self.cooldown_ms))
                    .unwrap_or(true);
                if !probe_stale {
                    return StoreRoute::Local;
                }
                *state = State::Degraded {
                    since_ms,
                    retry_at_ms,
                    probe_started_ms: Some(now_ms),
                };
                debug!("Probing distributed store");
                StoreRoute::Distributed { probe: true }
            }
        }
    }

    /// Record a successful distributed call.
    ///
    /// Only a probe can end the Degraded state; late successes from requests
    /// that were already in flight when the store went down are ignored.
    /// Returns `true` on the Degraded → Healthy transition.
    pub fn record_success(&self, now_ms: u64, probe: bool) -> bool {
        let mut state = self.state.lock();
        let current = *state;
        match current {
            State::Degraded { since_ms, .. } if probe => {
                *state = State::Healthy;
                self.recoveries.fetch_add(1, Ordering::Relaxed);
                info!(
                    degraded_for_ms = now_ms.saturating_sub(since_ms),
                    "Distributed store recovered, leaving degraded mode"
                );
                true
            }
            _ => false,
        }
    }

    /// Record a failed distributed call.
    ///
    /// Returns `true` on the Healthy → Degraded transition.
    pub fn record_failure(&self, now_ms: u64, probe: bool, error: &StoreError) -> bool {
        let mut state = self.state.lock();
        let retry_at_ms = now_ms.saturating_add(self.cooldown_ms);
        let current = *state;
        match current {
            State::Healthy => {
                *state = State::Degraded {
                    since_ms: now_ms,
                    retry_at_ms,
                    probe_started_ms: None,
                };
                self.downgrades.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %error,
                    cooldown_ms = self.cooldown_ms,
                    "Distributed store unavailable, falling back to local store"
                );
                true
            }
            State::Degraded { since_ms, .. } => {
                if probe {
                    *state = State::Degraded {
                        since_ms,
                        retry_at_ms,
                        probe_started_ms: None,
                    };
                    debug!(error = %error, "Distributed store probe failed");
                }
                false
            }
        }
    }

    /// Number of Healthy → Degraded transitions so far.
    pub fn downgrades(&self) -> u64 {
        self.downgrades.load(Ordering::Relaxed)
    }

    /// Number of Degraded → Healthy transitions so far.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down() -> StoreError {
        StoreError::unavailable("redis", "connection refused")
    }

    #[test]
    fn test_starts_healthy() {
        let health = StoreHealth::new(1_000);
        assert_eq!(health.state(), HealthState::Healthy);
        assert_eq!(health.route(0), StoreRoute::Distributed { probe: false });
    }

    #[test]
    fn test_failure_downgrades_once() {
        let health = StoreHealth::new(1_000);

        assert!(health.record_failure(10, false, &down()));
        assert!(!health.record_failure(11, false, &down()));
        assert!(!health.record_failure(12, false, &down()));

        assert_eq!(health.state(), HealthState::Degraded);
        assert_eq!(health.downgrades(), 1);
    }

    #[test]
    fn test_degraded_uses_local_until_cooldown() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());

        assert_eq!(health.route(500), StoreRoute::Local);
        assert_eq!(health.route(999), StoreRoute::Local);
        assert_eq!(health.route(1_000), StoreRoute::Distributed { probe: true });
    }

    #[test]
    fn test_single_probe_in_flight() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());

        assert_eq!(health.route(1_000), StoreRoute::Distributed { probe: true });
        assert_eq!(health.route(1_001), StoreRoute::Local);
        assert_eq!(health.route(1_500), StoreRoute::Local);
    }

    #[test]
    fn test_abandoned_probe_is_superseded() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());

        assert_eq!(health.route(1_000), StoreRoute::Distributed { probe: true });
        assert_eq!(health.route(2_000), StoreRoute::Distributed { probe: true });
    }

    #[test]
    fn test_probe_success_recovers() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());
        health.route(1_000);

        assert!(health.record_success(1_010, true));
        assert_eq!(health.state(), HealthState::Healthy);
        assert_eq!(health.recoveries(), 1);
        assert_eq!(health.route(1_020), StoreRoute::Distributed { probe: false });
    }

    #[test]
    fn test_probe_failure_restarts_cooldown() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());
        health.route(1_000);

        assert!(!health.record_failure(1_050, true, &down()));
        assert_eq!(health.downgrades(), 1);
        assert_eq!(health.route(1_500), StoreRoute::Local);
        assert_eq!(health.route(2_050), StoreRoute::Distributed { probe: true });
    }

    #[test]
    fn test_late_success_does_not_recover() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());

        assert!(!health.record_success(5, false));
        assert_eq!(health.state(), HealthState::Degraded);
    }

    #[test]
    fn test_late_failure_does_not_extend_cooldown() {
        let health = StoreHealth::new(1_000);
        health.record_failure(0, false, &down());
        health.record_failure(900, false, &down());

        assert_eq!(health.route(1_000), StoreRoute::Distributed { probe: true });
    }
}
