//! Registry of concurrency restrictions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::admission::Admission;
use crate::config::TollgateConfig;
use crate::error::{Result, TollgateError};
use crate::store::ConnectionProvider;

use super::restriction::{ConcurrencyRestriction, Release};

/// Concurrency limits for any number of resources, one per resource.
pub struct ConcurrencyLimiter {
    provider: Arc<dyn ConnectionProvider>,
    restrictions: HashMap<String, ConcurrencyRestriction>,
}

impl ConcurrencyLimiter {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            restrictions: HashMap::new(),
        }
    }

    /// Create a concurrency limiter with every limit listed in `config`.
    pub fn from_config(provider: Arc<dyn ConnectionProvider>, config: &TollgateConfig) -> Result<Self> {
        let mut limiter = Self::new(provider);
        for entry in &config.concurrency_limits {
            let restriction = ConcurrencyRestriction::new(
                &entry.resource,
                entry.limit,
                entry.safety_ttl_secs.map(Duration::from_secs),
            )?
            .with_namespace(&config.namespaces.concurrency);
            limiter.add_restriction(restriction)?;
        }
        Ok(limiter)
    }

    /// Register a restriction; one per resource.
    pub fn add_restriction(&mut self, restriction: ConcurrencyRestriction) -> Result<()> {
        if self.restrictions.contains_key(restriction.resource()) {
            return Err(TollgateError::Config(format!(
                "Already registered a concurrency restriction for resource {}",
                restriction.resource()
            )));
        }

        info!(
            resource = %restriction.resource(),
            limit = restriction.limit(),
            safety_ttl_secs = restriction.safety_ttl().map(|ttl| ttl.as_secs()),
            "Registered concurrency restriction"
        );
        self.restrictions
            .insert(restriction.resource().to_string(), restriction);
        Ok(())
    }

    pub fn is_restricted(&self, resource: &str) -> bool {
        self.restrictions.contains_key(resource)
    }

    pub fn restriction(&self, resource: &str) -> Option<&ConcurrencyRestriction> {
        self.restrictions.get(resource)
    }

    /// Names of all restricted resources.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.restrictions.keys().map(String::as_str)
    }

    fn registered(&self, resource: &str) -> Result<&ConcurrencyRestriction> {
        self.restrictions.get(resource).ok_or_else(|| {
            TollgateError::Config(format!(
                "No concurrency restriction set for resource {}",
                resource
            ))
        })
    }

    /// Take a slot for `resource`. Admitted with the new in-flight count.
    pub async fn start_work(&self, resource: &str) -> Result<Admission<i64>> {
        let restriction = self.registered(resource)?;
        let mut conn = self.provider.connection().await?;
        restriction.start_work(conn.as_mut()).await
    }

    /// Give back a slot taken with [`start_work`](Self::start_work).
    pub async fn end_work(&self, resource: &str) -> Result<Release> {
        let restriction = self.registered(resource)?;
        let mut conn = self.provider.connection().await?;
        restriction.end_work(conn.as_mut()).await
    }

    pub async fn in_flight(&self, resource: &str) -> Result<u64> {
        let restriction = self.registered(resource)?;
        let mut conn = self.provider.connection().await?;
        restriction.in_flight(conn.as_mut()).await
    }
}
