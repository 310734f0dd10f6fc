//! Redis-backed store adapter.
//!
//! WATCH is per-connection state, so every session gets a connection of its
//! own. Clean connections go back to a small idle pool when the session is
//! dropped; a connection dropped mid-watch is discarded instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, Value};
use tracing::{debug, warn};

use super::{
    ConnectionProvider, KeyTtl, Reply, StoreConnection, StoreError, StoreResult, TxOp,
};

/// Default number of idle connections kept for reuse.
pub const DEFAULT_MAX_IDLE: usize = 8;

type IdlePool = Arc<Mutex<Vec<MultiplexedConnection>>>;

/// Connection provider for a Redis (or Redis-compatible) server.
pub struct RedisStore {
    client: Client,
    idle: IdlePool,
    max_idle: usize,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("max_idle", &self.max_idle)
            .field("idle", &self.idle.lock().len())
            .finish()
    }
}

impl RedisStore {
    /// Connect to the server at `url` and verify it answers `PING`.
    pub async fn connect(url: &str, max_idle: usize) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::Redis(e)
        })?;

        let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            warn!(error = %e, "Failed to connect to Redis");
            StoreError::Redis(e)
        })?;

        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to ping Redis");
                StoreError::Redis(e)
            })?;

        debug!(max_idle, "Connected to Redis");

        let idle = Arc::new(Mutex::new(vec![conn]));
        Ok(Self {
            client,
            idle,
            max_idle,
        })
    }
}

#[async_trait]
impl ConnectionProvider for RedisStore {
    async fn connection(&self) -> StoreResult<Box<dyn StoreConnection>> {
        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };
        Ok(Box::new(RedisConnection {
            conn,
            idle: Arc::clone(&self.idle),
            max_idle: self.max_idle,
            watching: false,
        }))
    }
}

/// One Redis session.
pub struct RedisConnection {
    conn: MultiplexedConnection,
    idle: IdlePool,
    max_idle: usize,
    /// Set between WATCH and the EXEC/UNWATCH that clears it.
    watching: bool,
}

impl Drop for RedisConnection {
    fn drop(&mut self) {
        if self.watching {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(self.conn.clone());
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)
}

fn reply_from_value(value: Value) -> StoreResult<Reply> {
    match value {
        Value::Int(n) => Ok(Reply::Integer(n)),
        Value::Okay | Value::SimpleString(_) => Ok(Reply::Status),
        Value::BulkString(bytes) => Ok(Reply::Bulk(String::from_utf8_lossy(&bytes).into_owned())),
        Value::Nil => Ok(Reply::Nil),
        other => Err(StoreError::UnexpectedReply {
            command: "EXEC",
            reply: format!("{:?}", other),
        }),
    }
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn incr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        let value = redis::cmd("INCRBY")
            .arg(key)
            .arg(amount)
            .query_async::<i64>(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn decr_by(&mut self, key: &str, amount: i64) -> StoreResult<i64> {
        let value = redis::cmd("DECRBY")
            .arg(key)
            .arg(amount)
            .query_async::<i64>(&mut self.conn)
            .await?;
        Ok(value)
    }

    async fn set_with_expiry(&mut self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        redis::cmd("PSETEX")
            .arg(key)
            .arg(millis(ttl))
            .arg(value)
            .query_async::<()>(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let updated = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async::<bool>(&mut self.conn)
            .await?;
        Ok(updated)
    }

    async fn ttl(&mut self, key: &str) -> StoreResult<KeyTtl> {
        let millis = redis::cmd("PTTL")
            .arg(key)
            .query_async::<i64>(&mut self.conn)
            .await?;
        Ok(KeyTtl::from_millis(millis))
    }

    async fn exists(&mut self, key: &str) -> StoreResult<bool> {
        let exists = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<bool>(&mut self.conn)
            .await?;
        Ok(exists)
    }

    async fn delete(&mut self, key: &str) -> StoreResult<bool> {
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut self.conn)
            .await?;
        Ok(removed > 0)
    }

    async fn watch(&mut self, keys: &[String]) -> StoreResult<()> {
        self.watching = true;
        let mut cmd = redis::cmd("WATCH");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(&mut self.conn).await?;
        Ok(())
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        redis::cmd("UNWATCH").query_async::<()>(&mut self.conn).await?;
        self.watching = false;
        Ok(())
    }

    async fn exec(&mut self, ops: Vec<TxOp>) -> StoreResult<Option<Vec<Reply>>> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &ops {
            match op {
                TxOp::IncrBy { key, amount } => {
                    pipe.cmd("INCRBY").arg(key).arg(*amount);
                }
                TxOp::DecrBy { key, amount } => {
                    pipe.cmd("DECRBY").arg(key).arg(*amount);
                }
                TxOp::SetWithExpiry { key, value, ttl } => {
                    pipe.cmd("PSETEX").arg(key).arg(millis(*ttl)).arg(value);
                }
                TxOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
                }
                TxOp::Ttl { key } => {
                    pipe.cmd("PTTL").arg(key);
                }
                TxOp::Delete { key } => {
                    pipe.cmd("DEL").arg(key);
                }
            }
        }

        let values = pipe
            .query_async::<Option<Vec<Value>>>(&mut self.conn)
            .await?;
        self.watching = false;

        values
            .map(|values| values.into_iter().map(reply_from_value).collect())
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(3)), 3000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_reply_from_value() {
        assert_eq!(reply_from_value(Value::Int(4)).unwrap(), Reply::Integer(4));
        assert_eq!(reply_from_value(Value::Okay).unwrap(), Reply::Status);
        assert_eq!(reply_from_value(Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(
            reply_from_value(Value::BulkString(b"ratelimiter:jobs-60".to_vec())).unwrap(),
            Reply::Bulk("ratelimiter:jobs-60".to_string())
        );
        assert!(reply_from_value(Value::Array(vec![])).is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let result = RedisStore::connect("not-a-redis-url", DEFAULT_MAX_IDLE).await;
        assert!(matches!(result, Err(StoreError::Redis(_))));
    }
}
