//! Gatekeeper - Distributed Admission Control
//!
//! This crate decides, per request, whether a client may proceed on a given
//! route class. Hits are counted in a sliding window shared through Redis so
//! that every process enforces the same budget. When Redis is unreachable the
//! limiter keeps serving from a per-process fixed window and probes Redis
//! again after a cooldown.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;
