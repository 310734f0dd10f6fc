//! Registry of rate restrictions with all-or-nothing consumption.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace};

use crate::admission::{Admission, Rejection};
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::store::{ConnectionProvider, StoreConnection};

use super::restriction::{RateRestriction, Refund, RestrictionTx};

/// Usage snapshot of one window, as reported by [`RateLimiter::usage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUsage {
    /// Window length in seconds
    pub period_secs: u64,

    /// Units admitted per window
    pub limit: u64,

    /// Units consumed in the live window
    pub used: u64,

    /// Time until the live window ends; `None` when no window is open
    pub resets_in: Option<Duration>,
}

/// Rate limits for any number of resources, each with one or more windows.
///
/// Built once at startup and shared (typically behind an `Arc`); the
/// registry is never mutated after the first consume.
pub struct RateLimiter {
    provider: Arc<dyn ConnectionProvider>,
    /// Restrictions per resource, in registration order.
    restrictions: HashMap<String, Vec<Arc<RateRestriction>>>,
}

impl RateLimiter {
    /// Create an empty rate limiter on top of `provider`.
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            restrictions: HashMap::new(),
        }
    }

    /// Create a rate limiter with every window listed in `config`.
    pub fn from_config(provider: Arc<dyn ConnectionProvider>, config: &TollgateConfig) -> Result<Self> {
        let mut limiter = Self::new(provider);
        for entry in &config.rate_limits {
            for window in &entry.windows {
                let restriction = RateRestriction::new(&entry.resource, window.period_secs, window.limit)?
                    .with_namespace(&config.namespaces.rate);
                limiter.add_restriction(restriction)?;
            }
        }
        Ok(limiter)
    }

    /// Register a restriction.
    ///
    /// A second restriction with the same resource and window length is a
    /// configuration error.
    pub fn add_restriction(&mut self, restriction: RateRestriction) -> Result<()> {
        let registered = self
            .restrictions
            .entry(restriction.resource().to_string())
            .or_default();

        if registered
            .iter()
            .any(|r| r.period_secs() == restriction.period_secs())
        {
            return Err(TollgateError::Config(format!(
                "Already registered a {}s rate restriction for resource {}",
                restriction.period_secs(),
                restriction.resource()
            )));
        }

        info!(
            resource = %restriction.resource(),
            period_secs = restriction.period_secs(),
            limit = restriction.limit(),
            "Registered rate restriction"
        );
        registered.push(Arc::new(restriction));
        Ok(())
    }

    /// Whether any rate restriction is registered for `resource`.
    pub fn is_restricted(&self, resource: &str) -> bool {
        self.restrictions.contains_key(resource)
    }

    /// Restrictions registered for `resource`, in registration order.
    pub fn restrictions(&self, resource: &str) -> &[Arc<RateRestriction>] {
        self.restrictions
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Names of all restricted resources.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.restrictions.keys().map(String::as_str)
    }

    fn registered(&self, resource: &str) -> Result<&[Arc<RateRestriction>]> {
        self.restrictions
            .get(resource)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                TollgateError::Config(format!("No rate restrictions set for resource {}", resource))
            })
    }

    /// Reserve `amount` units of `resource` in every one of its windows.
    ///
    /// Either every window accepts the units and the transactions are
    /// returned, or whatever was already taken is given back and the call is
    /// rejected. Keep the transactions: they are needed to reimburse.
    pub async fn consume(&self, resource: &str, amount: u64) -> Result<Admission<Vec<RestrictionTx>>> {
        let restrictions = self.registered(resource)?;
        let mut conn = self.provider.connection().await?;
        let mut txs = Vec::with_capacity(restrictions.len());

        trace!(resource = %resource, amount, "Consuming rate quota");

        for restriction in restrictions {
            let rejection = match restriction.consume(conn.as_mut(), amount).await? {
                Admission::Admitted(tx) => {
                    let exceeded = tx.exceeds_limit();
                    txs.push(tx);
                    if !exceeded {
                        continue;
                    }
                    Rejection::QuotaExceeded
                }
                Admission::Rejected(rejection) => rejection,
            };

            debug!(
                resource = %resource,
                period_secs = restriction.period_secs(),
                limit = restriction.limit(),
                amount,
                reason = %rejection,
                "Rate quota not admitted, rolling back"
            );
            refund_all(conn.as_mut(), &txs, amount).await?;
            return Ok(Admission::Rejected(rejection));
        }

        Ok(Admission::Admitted(txs))
    }

    /// Give `amount` units back to every window in `txs`.
    ///
    /// Using the full consumed amount undoes the reservation; a smaller
    /// amount returns just the unused part. Asking for more than a
    /// transaction consumed is an invariant violation and changes nothing.
    pub async fn reimburse(&self, txs: &[RestrictionTx], amount: u64) -> Result<Vec<Refund>> {
        if let Some(tx) = txs.iter().find(|tx| amount > tx.amount()) {
            return Err(TollgateError::Invariant(format!(
                "Reimburse amount {} is greater than transaction amount {} for resource {}",
                amount,
                tx.amount(),
                tx.restriction().resource()
            )));
        }
        if amount == 0 || txs.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.provider.connection().await?;
        refund_all(conn.as_mut(), txs, amount).await
    }

    /// Current usage of each window of `resource`.
    pub async fn usage(&self, resource: &str) -> Result<Vec<WindowUsage>> {
        let restrictions = self.registered(resource)?;
        let mut conn = self.provider.connection().await?;
        let mut usage = Vec::with_capacity(restrictions.len());

        for restriction in restrictions {
            usage.push(WindowUsage {
                period_secs: restriction.period_secs(),
                limit: restriction.limit(),
                used: restriction.usage(conn.as_mut()).await?,
                resets_in: restriction.resets_in(conn.as_mut()).await?,
            });
        }
        Ok(usage)
    }
}

async fn refund_all(
    conn: &mut dyn StoreConnection,
    txs: &[RestrictionTx],
    amount: u64,
) -> Result<Vec<Refund>> {
    let mut refunds = Vec::with_capacity(txs.len());
    for tx in txs {
        refunds.push(tx.restriction().reimburse(conn, tx, amount).await?);
    }
    Ok(refunds)
}
