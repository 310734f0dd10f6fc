//! Hooks for a job-dispatch layer.
//!
//! A dispatcher calls [`DispatchHooks::before_reserve`] before taking a job
//! off a queue and [`DispatchHooks::after_perform`] once the job is done.
//! [`JobGate`] implements them on top of both limiters: a concurrency slot
//! and a pessimistic rate reservation are taken up front, and whatever the
//! job did not use is refunded afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use crate::admission::Admission;
use crate::concurrency::{ConcurrencyLimiter, Release};
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::ratelimit::{RateLimiter, RestrictionTx};
use crate::store::ConnectionProvider;

/// Lifecycle hooks a dispatcher invokes around each job.
#[async_trait]
pub trait DispatchHooks: Send + Sync {
    /// Reserve capacity for one job from `resource`.
    ///
    /// A rejection means the dispatcher should leave the queue alone for now.
    async fn before_reserve(&self, resource: &str) -> Result<Admission<Permit>>;

    /// Settle a permit after the job ran, whatever its outcome.
    async fn after_perform(&self, permit: Permit) -> Result<()>;

    /// Give back everything a permit holds, e.g. when the queue turned out
    /// to be empty.
    async fn abandon(&self, permit: Permit) -> Result<()>;
}

/// Capacity held by one job between reserve and perform.
#[derive(Debug)]
pub struct Permit {
    resource: String,
    reserved: u64,
    used: u64,
    rate_txs: Vec<RestrictionTx>,
    holds_slot: bool,
}

impl Permit {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Rate units reserved up front; zero if the resource has no rate limit.
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn holds_slot(&self) -> bool {
        self.holds_slot
    }

    pub fn rate_transactions(&self) -> &[RestrictionTx] {
        &self.rate_txs
    }

    /// Record `amount` units actually spent by the job.
    pub fn record_usage(&mut self, amount: u64) {
        self.used = self.used.saturating_add(amount);
    }
}

/// Combines a rate limiter and a concurrency limiter behind [`DispatchHooks`].
pub struct JobGate {
    rate: Arc<RateLimiter>,
    concurrency: Arc<ConcurrencyLimiter>,
    reserved: HashMap<String, u64>,
}

impl JobGate {
    pub fn new(rate: Arc<RateLimiter>, concurrency: Arc<ConcurrencyLimiter>) -> Self {
        Self {
            rate,
            concurrency,
            reserved: HashMap::new(),
        }
    }

    /// Build both limiters and the reserved amounts from `config`.
    pub fn from_config(provider: Arc<dyn ConnectionProvider>, config: &TollgateConfig) -> Result<Self> {
        config.validate()?;
        let rate = RateLimiter::from_config(Arc::clone(&provider), config)?;
        let concurrency = ConcurrencyLimiter::from_config(provider, config)?;

        let mut gate = Self::new(Arc::new(rate), Arc::new(concurrency));
        for entry in &config.rate_limits {
            gate.set_reserved(&entry.resource, entry.reserved)?;
        }
        Ok(gate)
    }

    /// Rate units reserved per job of `resource`.
    pub fn set_reserved(&mut self, resource: impl Into<String>, amount: u64) -> Result<()> {
        let resource = resource.into();
        if amount == 0 {
            return Err(TollgateError::Config(format!(
                "Reserved amount for resource {} must be at least 1",
                resource
            )));
        }
        self.reserved.insert(resource, amount);
        Ok(())
    }

    /// Rate units reserved per job of `resource`, 1 unless set.
    pub fn reserved_for(&self, resource: &str) -> u64 {
        self.reserved.get(resource).copied().unwrap_or(1)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate
    }

    pub fn concurrency_limiter(&self) -> &ConcurrencyLimiter {
        &self.concurrency
    }

    async fn release_slot(&self, resource: &str) -> Result<()> {
        if let Release::Expired = self.concurrency.end_work(resource).await? {
            warn!(resource = %resource, "Slot counter expired before the job finished");
        }
        Ok(())
    }

    async fn settle(&self, permit: &Permit, refund: Result<u64>) -> Result<()> {
        let refunded = match refund {
            Ok(amount) if amount > 0 => self.rate.reimburse(&permit.rate_txs, amount).await.map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        // The slot goes back even if the refund failed.
        if permit.holds_slot {
            self.release_slot(&permit.resource).await?;
        }
        refunded
    }
}

#[async_trait]
impl DispatchHooks for JobGate {
    async fn before_reserve(&self, resource: &str) -> Result<Admission<Permit>> {
        let mut permit = Permit {
            resource: resource.to_string(),
            reserved: 0,
            used: 0,
            rate_txs: Vec::new(),
            holds_slot: false,
        };

        if self.concurrency.is_restricted(resource) {
            if let Admission::Rejected(rejection) = self.concurrency.start_work(resource).await? {
                trace!(resource = %resource, reason = %rejection, "No concurrency slot");
                return Ok(Admission::Rejected(rejection));
            }
            permit.holds_slot = true;
        }

        if self.rate.is_restricted(resource) {
            let reserved = self.reserved_for(resource);
            let consumed = self.rate.consume(resource, reserved).await;
            let rejection = match consumed {
                Ok(Admission::Admitted(txs)) => {
                    permit.reserved = reserved;
                    permit.rate_txs = txs;
                    None
                }
                Ok(Admission::Rejected(rejection)) => Some(Ok(rejection)),
                Err(e) => Some(Err(e)),
            };

            if let Some(outcome) = rejection {
                if permit.holds_slot {
                    self.release_slot(resource).await?;
                }
                let rejection = outcome?;
                trace!(resource = %resource, reason = %rejection, "No rate quota");
                return Ok(Admission::Rejected(rejection));
            }
        }

        Ok(Admission::Admitted(permit))
    }

    async fn after_perform(&self, permit: Permit) -> Result<()> {
        let refund = if permit.rate_txs.is_empty() {
            Ok(0)
        } else if permit.used > permit.reserved {
            Err(TollgateError::Invariant(format!(
                "Job on resource {} used {} units but reserved only {}",
                permit.resource, permit.used, permit.reserved
            )))
        } else {
            Ok(permit.reserved - permit.used)
        };

        self.settle(&permit, refund).await
    }

    async fn abandon(&self, permit: Permit) -> Result<()> {
        let refund = if permit.rate_txs.is_empty() {
            Ok(0)
        } else {
            Ok(permit.reserved)
        };
        self.settle(&permit, refund).await
    }
}
