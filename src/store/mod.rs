//! Store adapter contract.
//!
//! The limiters only ever talk to the store through [`StoreConnection`],
//! obtained per operation from a [`ConnectionProvider`]. The contract is the
//! small Redis-shaped subset the windowed and slot counters need: counters,
//! expiry, and an optimistic WATCH/EXEC transaction.

mod memory;
mod redis_store;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::{MemoryConnection, MemoryStore};
pub use redis_store::{RedisConnection, RedisStore, DEFAULT_MAX_IDLE};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The Redis client failed (connection, protocol or command error).
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key held something other than what the command expects.
    #[error("Invalid value in key '{key}': {reason}")]
    InvalidValue {
        /// The offending key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The store answered with a reply of the wrong shape.
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Command whose reply was unexpected.
        command: &'static str,
        /// Debug rendering of the reply.
        reply: String,
    },
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Remaining lifetime of a key.
///
/// Decoded from the millisecond convention of `PTTL`: `-2` for a missing
/// key, `-1` for a key without expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist.
    Missing,
    /// The key exists and never expires.
    Persistent,
    /// The key expires after the given duration.
    Expires(Duration),
}

impl KeyTtl {
    /// Decode a `PTTL` style reply.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    /// Encode back into the `PTTL` convention.
    pub fn as_millis(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(ttl) => i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        }
    }

    /// Time left before expiry, if the key is live and expiring.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(ttl) => Some(*ttl),
            KeyTtl::Missing | KeyTtl::Persistent => None,
        }
    }
}

/// One command queued inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    /// `INCRBY key amount`
    IncrBy { key: String, amount: i64 },
    /// `DECRBY key amount`
    DecrBy { key: String, amount: i64 },
    /// `PSETEX key ttl value`
    SetWithExpiry { key: String, value: String, ttl: Duration },
    /// `PEXPIRE key ttl`
    Expire { key: String, ttl: Duration },
    /// `PTTL key`
    Ttl { key: String },
    /// `DEL key`
    Delete { key: String },
}

/// A single reply from an executed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Integer(i64),
    Status,
    Bulk(String),
    Nil,
}

impl Reply {
    /// The integer payload, if this is an integer reply.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

/// Pull the integer reply at `index` out of an executed transaction.
pub fn integer_reply(replies: &[Reply], index: usize, command: &'static str) -> StoreResult<i64> {
    replies
        .get(index)
        .and_then(Reply::as_integer)
        .ok_or_else(|| StoreError::UnexpectedReply {
            command,
            reply: format!("{:?}", replies.get(index)),
        })
}

/// Parse a counter value read with `GET`; a missing key counts as zero.
pub fn parse_counter(key: &str, value: Option<String>) -> StoreResult<i64> {
    match value {
        None => Ok(0),
        Some(raw) => raw.parse().map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected an integer counter, found {:?}", raw),
        }),
    }
}

/// A single session with the store.
///
/// Watch state belongs to the session: [`watch`](Self::watch) marks keys,
/// and the next [`exec`](Self::exec) commits only if none of them changed
/// (expiry counts as a change). `exec` always clears the watch set.
#[async_trait]
pub trait StoreConnection: Send {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>>;

    async fn incr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64>;

    async fn decr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64>;

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> StoreResult<()>;

    /// Returns `false` if the key does not exist.
    async fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool>;

    async fn ttl(&mut self, key: &str) -> StoreResult<KeyTtl>;

    async fn exists(&mut self, key: &str) -> StoreResult<bool>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&mut self, key: &str) -> StoreResult<bool>;

    /// Start watching `keys` for the next [`exec`](Self::exec).
    async fn watch(&mut self, keys: &[String]) -> StoreResult<()>;

    /// Drop the current watch set without executing anything.
    async fn unwatch(&mut self) -> StoreResult<()>;

    /// Run `ops` atomically.
    ///
    /// Returns `None` when a watched key changed since it was watched; in
    /// that case none of the operations were applied.
    async fn exec(&mut self, ops: Vec<TxOp>) -> StoreResult<Option<Vec<Reply>>>;
}

/// Source of store connections.
///
/// Every limiter operation asks for its own connection, so pooling or
/// reconnecting is entirely the provider's business.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connection(&self) -> StoreResult<Box<dyn StoreConnection>>;
}

#[async_trait]
impl<T: ConnectionProvider + ?Sized> ConnectionProvider for Arc<T> {
    async fn connection(&self) -> StoreResult<Box<dyn StoreConnection>> {
        (**self).connection().await
    }
}
