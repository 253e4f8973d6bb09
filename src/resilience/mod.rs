//! Resilience helpers.
//!
//! # Design Decisions
//! - Retrying is opt-in; the default policy performs a single attempt
//! - Delays grow exponentially and carry up to 10% jitter

pub mod backoff;

pub use backoff::{calculate_backoff, RetryPolicy};
