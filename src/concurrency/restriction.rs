//! Slot counter for a single resource.
//!
//! One integer key counts the units in flight. A safety TTL, refreshed on
//! every start, bounds how long slots taken by a crashed holder stay taken.

use std::fmt;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::admission::{Admission, Rejection};
use crate::error::{Result, TollgateError};
use crate::store::{integer_reply, parse_counter, KeyTtl, StoreConnection, StoreError, TxOp};

/// Namespace used for concurrency counter keys unless configured otherwise.
pub const DEFAULT_CONCURRENCY_NAMESPACE: &str = "concurrencylimiter";

/// At most `limit` units of one resource in flight at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyRestriction {
    resource: String,
    limit: u64,
    safety_ttl: Option<Duration>,
    namespace: String,
}

/// Outcome of releasing a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The slot was freed; `in_flight` is the count left.
    Released { in_flight: i64 },
    /// The counter was already gone (expired or never taken); nothing changed.
    Expired,
}

impl ConcurrencyRestriction {
    /// Create a restriction of `limit` concurrent units.
    ///
    /// Without a `safety_ttl` a holder that never calls `end_work` keeps its
    /// slot forever.
    pub fn new(resource: impl Into<String>, limit: u64, safety_ttl: Option<Duration>) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(TollgateError::Config(
                "Concurrency restriction needs a resource name".to_string(),
            ));
        }
        if safety_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(TollgateError::Config(format!(
                "Safety TTL for resource {} must be positive",
                resource
            )));
        }

        Ok(Self {
            resource,
            limit,
            safety_ttl,
            namespace: DEFAULT_CONCURRENCY_NAMESPACE.to_string(),
        })
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn safety_ttl(&self) -> Option<Duration> {
        self.safety_ttl
    }

    pub fn counter_key(&self) -> String {
        format!("{}:counter:{}", self.namespace, self.resource)
    }

    /// Take one slot.
    ///
    /// Refuses without touching the store when the counter is already at the
    /// limit. Otherwise increments under a watch on the counter, so two
    /// workers racing for the last slot cannot both get it. The admitted
    /// value is the in-flight count including this slot.
    pub async fn start_work(&self, conn: &mut dyn StoreConnection) -> Result<Admission<i64>> {
        let key = self.counter_key();

        conn.watch(std::slice::from_ref(&key)).await?;
        let current = parse_counter(&key, conn.get(&key).await?)?;
        if u64::try_from(current).is_ok_and(|current| current >= self.limit) {
            conn.unwatch().await?;
            debug!(
                resource = %self.resource,
                in_flight = current,
                limit = self.limit,
                "Concurrency limit reached"
            );
            return Ok(Admission::Rejected(Rejection::QuotaExceeded));
        }

        let mut ops = vec![TxOp::IncrBy {
            key: key.clone(),
            amount: 1,
        }];
        if let Some(ttl) = self.safety_ttl {
            ops.push(TxOp::Expire { key, ttl });
        }

        let Some(replies) = conn.exec(ops).await? else {
            warn!(
                resource = %self.resource,
                "Concurrency counter changed during start_work"
            );
            return Ok(Admission::Rejected(Rejection::TransactionAborted));
        };

        let in_flight = integer_reply(&replies, 0, "INCRBY")?;
        trace!(
            resource = %self.resource,
            in_flight,
            limit = self.limit,
            "Started work"
        );
        Ok(Admission::Admitted(in_flight))
    }

    /// Free one slot.
    ///
    /// The decrement is not guarded by a watch, so concurrent starts and ends
    /// on the same resource never cancel it. A counter that no longer exists
    /// is left alone: recreating it would hand a negative count to the next
    /// holder. If it vanishes between the existence check and the decrement,
    /// the recreated key is removed again.
    pub async fn end_work(&self, conn: &mut dyn StoreConnection) -> Result<Release> {
        let key = self.counter_key();

        if !conn.exists(&key).await? {
            debug!(
                resource = %self.resource,
                "Concurrency counter already expired, nothing to release"
            );
            return Ok(Release::Expired);
        }

        let ops = vec![
            TxOp::DecrBy {
                key: key.clone(),
                amount: 1,
            },
            TxOp::Ttl { key: key.clone() },
        ];
        let replies = conn.exec(ops).await?.ok_or(StoreError::UnexpectedReply {
            command: "EXEC",
            reply: "aborted without a watch".to_string(),
        })?;

        let in_flight = integer_reply(&replies, 0, "DECRBY")?;
        let ttl = KeyTtl::from_millis(integer_reply(&replies, 1, "PTTL")?);
        let recreated = in_flight < 0 || (self.safety_ttl.is_some() && ttl.remaining().is_none());

        if recreated {
            conn.delete(&key).await?;
            warn!(
                resource = %self.resource,
                in_flight,
                "Concurrency counter expired under the release, discarding"
            );
            return Ok(Release::Expired);
        }

        trace!(resource = %self.resource, in_flight, "Ended work");
        Ok(Release::Released { in_flight })
    }

    /// Units currently in flight.
    pub async fn in_flight(&self, conn: &mut dyn StoreConnection) -> Result<u64> {
        let key = self.counter_key();
        let current = parse_counter(&key, conn.get(&key).await?)?;
        Ok(u64::try_from(current).unwrap_or(0))
    }
}

impl fmt::Display for ConcurrencyRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Concurrency restriction of {} at a time for resource {}",
            self.limit, self.resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::InterferingProvider;
    use crate::store::{ConnectionProvider, MemoryStore};

    fn restriction(limit: u64) -> ConcurrencyRestriction {
        ConcurrencyRestriction::new("jobs", limit, Some(Duration::from_secs(30))).unwrap()
    }

    #[test]
    fn test_counter_key() {
        let r = restriction(2);
        assert_eq!(r.counter_key(), "concurrencylimiter:counter:jobs");
        assert_eq!(r.with_namespace("slots").counter_key(), "slots:counter:jobs");
    }

    #[test]
    fn test_new_validates() {
        assert!(ConcurrencyRestriction::new("", 1, None).is_err());
        assert!(ConcurrencyRestriction::new("jobs", 1, Some(Duration::ZERO)).is_err());
        assert!(ConcurrencyRestriction::new("jobs", 1, None).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            restriction(4).to_string(),
            "Concurrency restriction of 4 at a time for resource jobs"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_until_limit() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(2);

        assert_eq!(r.start_work(&mut conn).await.unwrap(), Admission::Admitted(1));
        assert_eq!(r.start_work(&mut conn).await.unwrap(), Admission::Admitted(2));
        assert_eq!(
            r.start_work(&mut conn).await.unwrap(),
            Admission::Rejected(Rejection::QuotaExceeded)
        );
        assert_eq!(r.in_flight(&mut conn).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_refreshes_safety_ttl() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(5);

        r.start_work(&mut conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        r.start_work(&mut conn).await.unwrap();

        assert_eq!(
            conn.ttl(&r.counter_key()).await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_safety_ttl_counter_persists() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = ConcurrencyRestriction::new("jobs", 1, None).unwrap();

        r.start_work(&mut conn).await.unwrap();
        assert_eq!(conn.ttl(&r.counter_key()).await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_frees_one_slot() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(2);

        r.start_work(&mut conn).await.unwrap();
        r.start_work(&mut conn).await.unwrap();
        assert_eq!(
            r.end_work(&mut conn).await.unwrap(),
            Release::Released { in_flight: 1 }
        );
        assert_eq!(r.start_work(&mut conn).await.unwrap(), Admission::Admitted(2));
        assert!(!r.start_work(&mut conn).await.unwrap().is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_after_expiry_does_not_corrupt_next_holder() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(2);

        r.start_work(&mut conn).await.unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(r.end_work(&mut conn).await.unwrap(), Release::Expired);
        assert!(!conn.exists(&r.counter_key()).await.unwrap());

        assert_eq!(r.start_work(&mut conn).await.unwrap(), Admission::Admitted(1));
        assert_eq!(r.in_flight(&mut conn).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_without_start_is_noop() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(2);

        assert_eq!(r.end_work(&mut conn).await.unwrap(), Release::Expired);
        assert!(store.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_start_aborts() {
        let store = MemoryStore::new();
        let r = restriction(1);

        // Another worker takes the last slot between our GET and EXEC.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::IncrBy {
                key: r.counter_key(),
                amount: 1,
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        let admission = r.start_work(conn.as_mut()).await.unwrap();
        assert_eq!(admission.rejection(), Some(Rejection::TransactionAborted));
        assert_eq!(r.in_flight(&mut store.connect()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_start_does_not_cancel_release() {
        let store = MemoryStore::new();
        let r = restriction(2);
        r.start_work(&mut store.connect()).await.unwrap();

        // A second worker takes a slot between our existence check and EXEC.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::IncrBy {
                key: r.counter_key(),
                amount: 1,
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        assert_eq!(
            r.end_work(conn.as_mut()).await.unwrap(),
            Release::Released { in_flight: 1 }
        );
        assert_eq!(
            r.end_work(&mut store.connect()).await.unwrap(),
            Release::Released { in_flight: 0 }
        );

        // No phantom slot: both slots are available again.
        assert_eq!(r.start_work(&mut store.connect()).await.unwrap(), Admission::Admitted(1));
        assert_eq!(r.start_work(&mut store.connect()).await.unwrap(), Admission::Admitted(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_vanishing_under_release_is_discarded() {
        let store = MemoryStore::new();
        let r = restriction(2);
        r.start_work(&mut store.connect()).await.unwrap();

        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::Delete {
                key: r.counter_key(),
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        assert_eq!(r.end_work(conn.as_mut()).await.unwrap(), Release::Expired);
        assert!(store.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanishing_persistent_counter_is_discarded() {
        let store = MemoryStore::new();
        let r = ConcurrencyRestriction::new("jobs", 2, None).unwrap();
        r.start_work(&mut store.connect()).await.unwrap();

        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::Delete {
                key: r.counter_key(),
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        assert_eq!(r.end_work(conn.as_mut()).await.unwrap(), Release::Expired);
        assert!(store.keys().is_empty());
    }
}
