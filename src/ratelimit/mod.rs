//! Fixed-window rate limiting backed by the shared store.

mod limiter;
mod restriction;

pub use limiter::{RateLimiter, WindowUsage};
pub use restriction::{RateRestriction, Refund, RestrictionTx, DEFAULT_RATE_NAMESPACE};
