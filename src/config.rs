//! Configuration management for Tollgate.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::concurrency::DEFAULT_CONCURRENCY_NAMESPACE;
use crate::error::{Result, TollgateError};
use crate::ratelimit::DEFAULT_RATE_NAMESPACE;
use crate::store::DEFAULT_MAX_IDLE;

/// Environment variable prefix for overrides, e.g. `TOLLGATE__STORE__URL`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration: where the store lives and which limits apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Key namespaces
    #[serde(default)]
    pub namespaces: NamespaceConfig,

    /// Rate limits per resource
    #[serde(default)]
    pub rate_limits: Vec<RateLimitEntry>,

    /// Concurrency limits per resource
    #[serde(default)]
    pub concurrency_limits: Vec<ConcurrencyLimitEntry>,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Idle connections kept for reuse
    #[serde(default = "default_max_idle")]
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            max_idle_connections: default_max_idle(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_idle() -> usize {
    DEFAULT_MAX_IDLE
}

/// Prefixes for every key the limiters write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    #[serde(default = "default_rate_namespace")]
    pub rate: String,

    #[serde(default = "default_concurrency_namespace")]
    pub concurrency: String,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            rate: default_rate_namespace(),
            concurrency: default_concurrency_namespace(),
        }
    }
}

fn default_rate_namespace() -> String {
    DEFAULT_RATE_NAMESPACE.to_string()
}

fn default_concurrency_namespace() -> String {
    DEFAULT_CONCURRENCY_NAMESPACE.to_string()
}

/// Rate windows of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub resource: String,

    /// Units the job gate reserves before a job runs
    #[serde(default = "default_reserved")]
    pub reserved: u64,

    pub windows: Vec<WindowEntry>,
}

fn default_reserved() -> u64 {
    1
}

/// A single fixed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub period_secs: u64,
    pub limit: u64,
}

/// Concurrency limit of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyLimitEntry {
    pub resource: String,
    pub limit: u64,

    /// Lifetime of the slot counter, refreshed on every start; `null`
    /// disables it
    #[serde(default = "default_safety_ttl")]
    pub safety_ttl_secs: Option<u64>,
}

fn default_safety_ttl() -> Option<u64> {
    Some(3600)
}

impl TollgateConfig {
    /// Parse a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: TollgateConfig =
            serde_yaml::from_str(contents).map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, with `TOLLGATE__*` environment variables layered on
    /// top (`TOLLGATE__STORE__URL` overrides `store.url`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TollgateError::Config(format!(
                "Config file {} not found",
                path.display()
            )));
        }

        let config: TollgateConfig = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiters could never honour.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.rate_limits {
            if entry.resource.is_empty() {
                return Err(TollgateError::Config(
                    "Rate limit entry without a resource".to_string(),
                ));
            }
            if !seen.insert(entry.resource.as_str()) {
                return Err(TollgateError::Config(format!(
                    "Rate limits for resource {} listed twice",
                    entry.resource
                )));
            }
            if entry.windows.is_empty() {
                return Err(TollgateError::Config(format!(
                    "Rate limit for resource {} has no windows",
                    entry.resource
                )));
            }
            if entry.reserved == 0 {
                return Err(TollgateError::Config(format!(
                    "Reserved amount for resource {} must be at least 1",
                    entry.resource
                )));
            }

            let mut periods = HashSet::new();
            for window in &entry.windows {
                if window.period_secs == 0 {
                    return Err(TollgateError::Config(format!(
                        "Window period for resource {} must be positive",
                        entry.resource
                    )));
                }
                if !periods.insert(window.period_secs) {
                    return Err(TollgateError::Config(format!(
                        "Window of {}s for resource {} listed twice",
                        window.period_secs, entry.resource
                    )));
                }
                if entry.reserved > window.limit {
                    return Err(TollgateError::Config(format!(
                        "Reserved amount {} for resource {} exceeds the {}s limit of {}",
                        entry.reserved, entry.resource, window.period_secs, window.limit
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for entry in &self.concurrency_limits {
            if entry.resource.is_empty() {
                return Err(TollgateError::Config(
                    "Concurrency limit entry without a resource".to_string(),
                ));
            }
            if !seen.insert(entry.resource.as_str()) {
                return Err(TollgateError::Config(format!(
                    "Concurrency limit for resource {} listed twice",
                    entry.resource
                )));
            }
            if entry.safety_ttl_secs == Some(0) {
                return Err(TollgateError::Config(format!(
                    "Safety TTL for resource {} must be positive",
                    entry.resource
                )));
            }
        }

        Ok(())
    }

    /// Units reserved per job for `resource`.
    pub fn reserved_for(&self, resource: &str) -> u64 {
        self.rate_limits
            .iter()
            .find(|entry| entry.resource == resource)
            .map(|entry| entry.reserved)
            .unwrap_or_else(default_reserved)
    }
}
