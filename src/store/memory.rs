//! In-process store with Redis-like counter, expiry and WATCH semantics.
//!
//! Used for tests and for single-process deployments. Expiry runs on
//! `tokio::time::Instant`, so paused-time tests can step across window and
//! safety-TTL boundaries deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{
    ConnectionProvider, KeyTtl, Reply, StoreConnection, StoreError, StoreResult, TxOp,
};

/// A stored value with its expiry and last-modified revision.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
    revision: u64,
}

/// The shared keyspace. Every mutation bumps the global revision.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    revision: u64,
}

impl Keyspace {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Drop the key if it has expired; return the live entry otherwise.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    /// Revision of the live key, `None` if missing or expired.
    fn revision_of(&mut self, key: &str) -> Option<u64> {
        self.live(key).map(|entry| entry.revision)
    }

    fn get(&mut self, key: &str) -> Option<String> {
        self.live(key).map(|entry| entry.value.clone())
    }

    /// INCRBY semantics: missing keys start at zero, an existing expiry is kept.
    fn incr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        let revision = self.next_revision();
        let (current, expires_at) = match self.live(key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| StoreError::InvalidValue {
                    key: key.to_string(),
                    reason: "value is not an integer".to_string(),
                })?;
                (current, entry.expires_at)
            }
            None => (0, None),
        };
        let updated = current.checked_add(amount).ok_or_else(|| StoreError::InvalidValue {
            key: key.to_string(),
            reason: "increment would overflow".to_string(),
        })?;
        self.entries.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at,
                revision,
            },
        );
        Ok(updated)
    }

    fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) {
        let revision = self.next_revision();
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
                revision,
            },
        );
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let revision = self.next_revision();
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                entry.revision = revision;
                true
            }
            None => false,
        }
    }

    fn ttl(&mut self, key: &str) -> KeyTtl {
        let now = Instant::now();
        match self.live(key) {
            None => KeyTtl::Missing,
            Some(Entry { expires_at: None, .. }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::Expires(deadline.saturating_duration_since(now)),
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        let existed = self.live(key).is_some();
        if existed {
            self.entries.remove(key);
            self.next_revision();
        }
        existed
    }

    fn apply(&mut self, op: &TxOp) -> StoreResult<Reply> {
        let reply = match op {
            TxOp::IncrBy { key, amount } => Reply::Integer(self.incr_by(key, *amount)?),
            TxOp::DecrBy { key, amount } => Reply::Integer(self.incr_by(key, -*amount)?),
            TxOp::SetWithExpiry { key, value, ttl } => {
                self.set_with_expiry(key, value, *ttl);
                Reply::Status
            }
            TxOp::Expire { key, ttl } => Reply::Integer(i64::from(self.expire(key, *ttl))),
            TxOp::Ttl { key } => Reply::Integer(self.ttl(key).as_millis()),
            TxOp::Delete { key } => Reply::Integer(i64::from(self.delete(key))),
        };
        Ok(reply)
    }
}

/// In-memory store shared by every connection it hands out.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        let names: Vec<String> = keyspace.entries.keys().cloned().collect();
        let mut live: Vec<String> = names
            .into_iter()
            .filter(|name| keyspace.live(name).is_some())
            .collect();
        live.sort();
        live
    }

    /// Open a connection without going through the provider trait.
    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            keyspace: Arc::clone(&self.keyspace),
            watched: Vec::new(),
        }
    }
}

#[async_trait]
impl ConnectionProvider for MemoryStore {
    async fn connection(&self) -> StoreResult<Box<dyn StoreConnection>> {
        Ok(Box::new(self.connect()))
    }
}

/// A session on a [`MemoryStore`], carrying its own watch set.
#[derive(Debug)]
pub struct MemoryConnection {
    keyspace: Arc<Mutex<Keyspace>>,
    /// Watched keys with the revision observed when the watch started.
    watched: Vec<(String, Option<u64>)>,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.keyspace.lock().get(key))
    }

    async fn incr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        self.keyspace.lock().incr_by(key, amount)
    }

    async fn decr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        self.keyspace.lock().incr_by(key, -amount)
    }

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.keyspace.lock().set_with_expiry(key, value, ttl);
        Ok(())
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Ok(self.keyspace.lock().expire(key, ttl))
    }

    async fn ttl(&mut self, key: &str) -> StoreResult<KeyTtl> {
        Ok(self.keyspace.lock().ttl(key))
    }

    async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.keyspace.lock().live(key).is_some())
    }

    async fn delete(&mut self, key: &str) -> StoreResult<bool> {
        Ok(self.keyspace.lock().delete(key))
    }

    async fn watch(&mut self, keys: &[String]) -> StoreResult<()> {
        let mut keyspace = self.keyspace.lock();
        for key in keys {
            let revision = keyspace.revision_of(key);
            self.watched.push((key.clone(), revision));
        }
        Ok(())
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        self.watched.clear();
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<TxOp>) -> StoreResult<Option<Vec<Reply>>> {
        let watched = std::mem::take(&mut self.watched);
        let mut keyspace = self.keyspace.lock();

        for (key, revision) in &watched {
            if keyspace.revision_of(key) != *revision {
                return Ok(None);
            }
        }

        let mut replies = Vec::with_capacity(ops.len());
        for op in &ops {
            replies.push(keyspace.apply(op)?);
        }
        Ok(Some(replies))
    }
}
