//! Resilience primitives shared by the engine and by capability wrappers.
//!
//! - `retry` -- bounded exponential backoff with jitter
//! - `circuit_breaker` -- three-state breaker shared across calls to one call-site

pub mod circuit_breaker;
pub mod retry;
