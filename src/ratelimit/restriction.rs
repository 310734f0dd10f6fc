//! Windowed counter for a single (resource, window) rule.
//!
//! Each window is a pair of keys that expire together: a pointer at a fixed
//! name, and a value key with a unique suffix that holds the count. When the
//! window ends both disappear, and the next consume starts a fresh pair, so a
//! stale value key can never be reached through the pointer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::admission::{Admission, Rejection};
use crate::error::{Result, TollgateError};
use crate::store::{integer_reply, parse_counter, KeyTtl, StoreConnection, TxOp};

/// Namespace used for rate counter keys unless configured otherwise.
pub const DEFAULT_RATE_NAMESPACE: &str = "ratelimiter";

/// A limit of `limit` units per `period_secs` window for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateRestriction {
    resource: String,
    period_secs: u64,
    limit: u64,
    namespace: String,
}

/// Outcome of handing units back to a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refund {
    /// The counter was decremented; `value` is what it holds now.
    Applied { value: i64 },
    /// The window already ended, so there was nothing to give back.
    Expired,
    /// The window rolled over between the check and the decrement.
    Aborted,
}

/// Record of one successful increment against one restriction.
///
/// Needed to give the units back later: it names the exact value key that was
/// incremented, so a refund never lands in a later window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestrictionTx {
    restriction: Arc<RateRestriction>,
    value_key: String,
    amount: u64,
    value: i64,
}

impl RestrictionTx {
    /// The restriction this transaction was made against.
    pub fn restriction(&self) -> &Arc<RateRestriction> {
        &self.restriction
    }

    /// The value key that was incremented.
    pub fn value_key(&self) -> &str {
        &self.value_key
    }

    /// Units consumed by this transaction.
    pub fn amount(&self) -> u64 {
        self.amount
    }

    /// Counter value right after the increment.
    pub fn value(&self) -> i64 {
        self.value
    }

    /// Whether the increment pushed the window over its limit.
    pub fn exceeds_limit(&self) -> bool {
        u64::try_from(self.value).is_ok_and(|value| value > self.restriction.limit)
    }
}

fn signed(amount: u64) -> Result<i64> {
    i64::try_from(amount)
        .map_err(|_| TollgateError::Invariant(format!("amount {} is out of range", amount)))
}

impl RateRestriction {
    /// Create a restriction of `limit` units per `period_secs` seconds.
    pub fn new(resource: impl Into<String>, period_secs: u64, limit: u64) -> Result<Self> {
        let resource = resource.into();
        if resource.is_empty() {
            return Err(TollgateError::Config(
                "Rate restriction needs a resource name".to_string(),
            ));
        }
        if period_secs == 0 {
            return Err(TollgateError::Config(format!(
                "Rate restriction for resource {} needs a window of at least one second",
                resource
            )));
        }

        Ok(Self {
            resource,
            period_secs,
            limit,
            namespace: DEFAULT_RATE_NAMESPACE.to_string(),
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

    pub fn period_secs(&self) -> u64 {
        self.period_secs
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Key holding the name of the live value key, if any.
    pub fn pointer_key(&self) -> String {
        format!("{}:{}-{}", self.namespace, self.resource, self.period_secs)
    }

    fn new_value_key(&self) -> String {
        format!("{}-{}", self.pointer_key(), Uuid::new_v4())
    }

    /// Add `amount` to the live window, opening one if there is none.
    ///
    /// The returned transaction may exceed the limit; deciding what to do
    /// about that is up to the caller. A rejection here means the window
    /// could not be updated safely, not that the limit was hit.
    pub async fn consume(
        self: &Arc<Self>,
        conn: &mut dyn StoreConnection,
        amount: u64,
    ) -> Result<Admission<RestrictionTx>> {
        let delta = signed(amount)?;
        let pointer = self.pointer_key();

        conn.watch(std::slice::from_ref(&pointer)).await?;
        match conn.get(&pointer).await? {
            None => self.open_window(conn, pointer, amount, delta).await,
            Some(value_key) => self.increment_window(conn, value_key, amount, delta).await,
        }
    }

    async fn open_window(
        self: &Arc<Self>,
        conn: &mut dyn StoreConnection,
        pointer: String,
        amount: u64,
        delta: i64,
    ) -> Result<Admission<RestrictionTx>> {
        let value_key = self.new_value_key();
        let ops = vec![
            TxOp::SetWithExpiry {
                key: value_key.clone(),
                value: delta.to_string(),
                ttl: self.period(),
            },
            TxOp::SetWithExpiry {
                key: pointer,
                value: value_key.clone(),
                ttl: self.period(),
            },
        ];

        if conn.exec(ops).await?.is_none() {
            warn!(
                resource = %self.resource,
                period_secs = self.period_secs,
                "Another consumer opened the window first"
            );
            return Ok(Admission::Rejected(Rejection::TransactionAborted));
        }

        debug!(
            resource = %self.resource,
            period_secs = self.period_secs,
            value_key = %value_key,
            amount,
            "Opened new rate window"
        );

        Ok(Admission::Admitted(RestrictionTx {
            restriction: Arc::clone(self),
            value_key,
            amount,
            value: delta,
        }))
    }

    async fn increment_window(
        self: &Arc<Self>,
        conn: &mut dyn StoreConnection,
        value_key: String,
        amount: u64,
        delta: i64,
    ) -> Result<Admission<RestrictionTx>> {
        let ops = vec![
            TxOp::IncrBy {
                key: value_key.clone(),
                amount: delta,
            },
            TxOp::Ttl {
                key: value_key.clone(),
            },
        ];

        let Some(replies) = conn.exec(ops).await? else {
            warn!(
                resource = %self.resource,
                period_secs = self.period_secs,
                "Rate window rolled over during consume"
            );
            return Ok(Admission::Rejected(Rejection::TransactionAborted));
        };

        let value = integer_reply(&replies, 0, "INCRBY")?;
        let ttl = KeyTtl::from_millis(integer_reply(&replies, 1, "PTTL")?);

        if ttl.remaining().is_none() {
            // INCRBY recreated a value key that had just expired; it has no
            // expiry and no pointer, so remove it rather than count into it.
            conn.delete(&value_key).await?;
            warn!(
                resource = %self.resource,
                period_secs = self.period_secs,
                value_key = %value_key,
                "Rate window expired under the increment, discarding"
            );
            return Ok(Admission::Rejected(Rejection::CounterExpired));
        }

        trace!(
            resource = %self.resource,
            period_secs = self.period_secs,
            amount,
            value,
            limit = self.limit,
            "Incremented rate window"
        );

        Ok(Admission::Admitted(RestrictionTx {
            restriction: Arc::clone(self),
            value_key,
            amount,
            value,
        }))
    }

    /// Give `amount` units of `tx` back to its window.
    ///
    /// A window that has already ended is left alone: its quota expired
    /// together with it.
    pub async fn reimburse(
        &self,
        conn: &mut dyn StoreConnection,
        tx: &RestrictionTx,
        amount: u64,
    ) -> Result<Refund> {
        let delta = signed(amount)?;
        let pointer = self.pointer_key();

        conn.watch(std::slice::from_ref(&pointer)).await?;
        if !conn.exists(&tx.value_key).await? {
            conn.unwatch().await?;
            debug!(
                resource = %self.resource,
                period_secs = self.period_secs,
                amount,
                "Rate window already ended, nothing to reimburse"
            );
            return Ok(Refund::Expired);
        }

        let ops = vec![
            TxOp::DecrBy {
                key: tx.value_key.clone(),
                amount: delta,
            },
            TxOp::Ttl {
                key: tx.value_key.clone(),
            },
        ];
        let Some(replies) = conn.exec(ops).await? else {
            warn!(
                resource = %self.resource,
                period_secs = self.period_secs,
                amount,
                "Rate window rolled over during reimburse"
            );
            return Ok(Refund::Aborted);
        };

        let value = integer_reply(&replies, 0, "DECRBY")?;
        let ttl = KeyTtl::from_millis(integer_reply(&replies, 1, "PTTL")?);

        if ttl.remaining().is_none() {
            // The value key expired ahead of its pointer and DECRBY recreated
            // it without expiry; nothing reaches it, so drop it.
            conn.delete(&tx.value_key).await?;
            warn!(
                resource = %self.resource,
                period_secs = self.period_secs,
                value_key = %tx.value_key,
                "Rate window expired under the reimburse, discarding"
            );
            return Ok(Refund::Expired);
        }

        trace!(
            resource = %self.resource,
            period_secs = self.period_secs,
            amount,
            value,
            "Reimbursed rate window"
        );
        Ok(Refund::Applied { value })
    }

    /// Units consumed in the live window; zero if no window is open.
    pub async fn usage(&self, conn: &mut dyn StoreConnection) -> Result<u64> {
        let Some(value_key) = conn.get(&self.pointer_key()).await? else {
            return Ok(0);
        };
        let value = parse_counter(&value_key, conn.get(&value_key).await?)?;
        Ok(u64::try_from(value).unwrap_or(0))
    }

    /// Time until the live window ends, `None` if no window is open.
    pub async fn resets_in(&self, conn: &mut dyn StoreConnection) -> Result<Option<Duration>> {
        Ok(conn.ttl(&self.pointer_key()).await?.remaining())
    }
}

impl fmt::Display for RateRestriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rate restriction of {} per {}s for resource {}",
            self.limit, self.period_secs, self.resource
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::InterferingProvider;
    use crate::store::{ConnectionProvider, MemoryStore};

    fn restriction(limit: u64) -> Arc<RateRestriction> {
        Arc::new(RateRestriction::new("jobs", 60, limit).unwrap())
    }

    #[test]
    fn test_key_naming() {
        let r = RateRestriction::new("jobs", 3600, 25).unwrap();
        assert_eq!(r.pointer_key(), "ratelimiter:jobs-3600");

        let r = r.with_namespace("quota");
        assert_eq!(r.pointer_key(), "quota:jobs-3600");
        assert!(r.new_value_key().starts_with("quota:jobs-3600-"));
        assert_ne!(r.new_value_key(), r.new_value_key());
    }

    #[test]
    fn test_new_validates() {
        assert!(matches!(
            RateRestriction::new("", 60, 1),
            Err(TollgateError::Config(_))
        ));
        assert!(matches!(
            RateRestriction::new("jobs", 0, 1),
            Err(TollgateError::Config(_))
        ));
    }

    #[test]
    fn test_display() {
        let r = RateRestriction::new("jobs", 3600, 25).unwrap();
        assert_eq!(
            r.to_string(),
            "Rate restriction of 25 per 3600s for resource jobs"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_consume_opens_window() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(10);

        let tx = r.consume(&mut conn, 3).await.unwrap().admitted().unwrap();
        assert_eq!(tx.value(), 3);
        assert_eq!(tx.amount(), 3);
        assert!(!tx.exceeds_limit());
        assert!(tx.value_key().starts_with("ratelimiter:jobs-60-"));

        assert_eq!(store.keys().len(), 2);
        assert_eq!(
            conn.ttl(&r.pointer_key()).await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(60))
        );
        assert_eq!(
            conn.ttl(tx.value_key()).await.unwrap(),
            KeyTtl::Expires(Duration::from_secs(60))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_accumulates_in_window() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(10);

        let first = r.consume(&mut conn, 4).await.unwrap().admitted().unwrap();
        let second = r.consume(&mut conn, 4).await.unwrap().admitted().unwrap();
        let third = r.consume(&mut conn, 4).await.unwrap().admitted().unwrap();

        assert_eq!(first.value_key(), second.value_key());
        assert_eq!(second.value(), 8);
        assert!(!second.exceeds_limit());
        assert_eq!(third.value(), 12);
        assert!(third.exceeds_limit());
        assert_eq!(r.usage(&mut conn).await.unwrap(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(5);

        let old = r.consume(&mut conn, 5).await.unwrap().admitted().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            r.resets_in(&mut conn).await.unwrap(),
            Some(Duration::from_secs(30))
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(r.resets_in(&mut conn).await.unwrap(), None);
        assert_eq!(r.usage(&mut conn).await.unwrap(), 0);

        let fresh = r.consume(&mut conn, 1).await.unwrap().admitted().unwrap();
        assert_ne!(old.value_key(), fresh.value_key());
        assert_eq!(fresh.value(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reimburse_decrements_window() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(10);

        let tx = r.consume(&mut conn, 6).await.unwrap().admitted().unwrap();
        let refund = r.reimburse(&mut conn, &tx, 4).await.unwrap();

        assert_eq!(refund, Refund::Applied { value: 2 });
        assert_eq!(r.usage(&mut conn).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reimburse_after_rollover_is_noop() {
        let store = MemoryStore::new();
        let mut conn = store.connect();
        let r = restriction(10);

        let stale = r.consume(&mut conn, 6).await.unwrap().admitted().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        r.consume(&mut conn, 2).await.unwrap().admitted().unwrap();

        let refund = r.reimburse(&mut conn, &stale, 6).await.unwrap();
        assert_eq!(refund, Refund::Expired);
        assert_eq!(r.usage(&mut conn).await.unwrap(), 2);
        // The stale value key must not come back to life.
        assert!(!conn.exists(stale.value_key()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_aborts_when_pointer_changes() {
        let store = MemoryStore::new();
        let r = restriction(10);
        let existing = r.consume(&mut store.connect(), 1).await.unwrap().admitted().unwrap();

        // Another process rewrites the pointer between WATCH and EXEC.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::SetWithExpiry {
                key: r.pointer_key(),
                value: existing.value_key().to_string(),
                ttl: Duration::from_secs(60),
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        let admission = r.consume(conn.as_mut(), 1).await.unwrap();
        assert_eq!(admission.rejection(), Some(Rejection::TransactionAborted));
        assert_eq!(r.usage(&mut store.connect()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_window_creation_aborts() {
        let store = MemoryStore::new();
        let r = restriction(10);

        // Someone else opens the window after our GET saw it missing.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![
                TxOp::SetWithExpiry {
                    key: "ratelimiter:jobs-60-other".to_string(),
                    value: "7".to_string(),
                    ttl: Duration::from_secs(60),
                },
                TxOp::SetWithExpiry {
                    key: r.pointer_key(),
                    value: "ratelimiter:jobs-60-other".to_string(),
                    ttl: Duration::from_secs(60),
                },
            ]],
        );
        let mut conn = provider.connection().await.unwrap();

        let admission = r.consume(conn.as_mut(), 1).await.unwrap();
        assert_eq!(admission.rejection(), Some(Rejection::TransactionAborted));
        assert_eq!(r.usage(&mut store.connect()).await.unwrap(), 7);
        assert_eq!(store.keys().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreated_value_key_is_discarded() {
        let store = MemoryStore::new();
        let r = restriction(10);
        let existing = r.consume(&mut store.connect(), 3).await.unwrap().admitted().unwrap();

        // The value key vanishes while the pointer is untouched, so the
        // watch holds and INCRBY recreates the key without an expiry.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::Delete {
                key: existing.value_key().to_string(),
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        let admission = r.consume(conn.as_mut(), 1).await.unwrap();
        assert_eq!(admission.rejection(), Some(Rejection::CounterExpired));
        assert_eq!(store.keys(), vec![r.pointer_key()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reimburse_discards_value_key_expiring_before_exec() {
        let store = MemoryStore::new();
        let r = restriction(10);
        let tx = r.consume(&mut store.connect(), 6).await.unwrap().admitted().unwrap();

        // The value key expires ahead of its pointer after our existence
        // check, so DECRBY would recreate it as a negative counter.
        let provider = InterferingProvider::new(
            store.clone(),
            vec![vec![TxOp::Delete {
                key: tx.value_key().to_string(),
            }]],
        );
        let mut conn = provider.connection().await.unwrap();

        let refund = r.reimburse(conn.as_mut(), &tx, 6).await.unwrap();
        assert_eq!(refund, Refund::Expired);
        assert_eq!(store.keys(), vec![r.pointer_key()]);
        assert_eq!(store.connect().get(tx.value_key()).await.unwrap(), None);
    }
}
