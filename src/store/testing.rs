//! Test helpers that inject competing writes between WATCH and EXEC.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::memory::MemoryConnection;
use super::{
    ConnectionProvider, KeyTtl, MemoryStore, Reply, StoreConnection, StoreResult, TxOp,
};

/// Provider whose connections run a scripted "other process" write right
/// before each `exec`.
///
/// The script is consumed front to back, one entry per `exec` call across
/// all connections; an empty entry means no interference for that call.
pub(crate) struct InterferingProvider {
    store: MemoryStore,
    script: Arc<Mutex<VecDeque<Vec<TxOp>>>>,
}

impl InterferingProvider {
    pub(crate) fn new(store: MemoryStore, script: Vec<Vec<TxOp>>) -> Self {
        Self {
            store,
            script: Arc::new(Mutex::new(script.into())),
        }
    }
}

#[async_trait]
impl ConnectionProvider for InterferingProvider {
    async fn connection(&self) -> StoreResult<Box<dyn StoreConnection>> {
        Ok(Box::new(InterferingConnection {
            inner: self.store.connect(),
            intruder: self.store.connect(),
            script: Arc::clone(&self.script),
        }))
    }
}

struct InterferingConnection {
    inner: MemoryConnection,
    intruder: MemoryConnection,
    script: Arc<Mutex<VecDeque<Vec<TxOp>>>>,
}

#[async_trait]
impl StoreConnection for InterferingConnection {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn incr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        self.inner.incr_by(key, amount).await
    }

    async fn decr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        self.inner.decr_by(key, amount).await
    }

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&mut self, key: &str) -> StoreResult<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    async fn delete(&mut self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn watch(&mut self, keys: &[String]) -> StoreResult<()> {
        self.inner.watch(keys).await
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        self.inner.unwatch().await
    }

    async fn exec(&mut self, ops: Vec<TxOp>) -> StoreResult<Option<Vec<Reply>>> {
        let interference = self.script.lock().pop_front().unwrap_or_default();
        if !interference.is_empty() {
            self.intruder.exec(interference).await?;
        }
        self.inner.exec(ops).await
    }
}
