//! Concurrency limiting: bounded slots per resource with a safety TTL.

mod limiter;
mod restriction;

pub use limiter::ConcurrencyLimiter;
pub use restriction::{ConcurrencyRestriction, Release, DEFAULT_CONCURRENCY_NAMESPACE};
