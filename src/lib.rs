//! Tollgate - Cross-Process Rate and Concurrency Limiting
//!
//! This crate coordinates shared quotas for named resources (typically work
//! queues) between independent worker processes. All coordination happens
//! through a Redis-compatible store using counters, expiry and optimistic
//! WATCH/EXEC transactions; no process talks to another directly.
//!
//! Two limiters are provided. [`RateLimiter`](ratelimit::RateLimiter) admits
//! a bounded number of units per fixed window, with any number of window
//! lengths per resource. [`ConcurrencyLimiter`](concurrency::ConcurrencyLimiter)
//! bounds the units in flight at once. [`JobGate`](gate::JobGate) composes
//! both into before-reserve / after-perform hooks for a job dispatcher.

pub mod admission;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod gate;
pub mod ratelimit;
pub mod store;
