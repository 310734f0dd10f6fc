use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tollgate::admission::Admission;
use tollgate::concurrency::{ConcurrencyLimiter, Release};
use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RateLimiter;
use tollgate::store::{ConnectionProvider, MemoryStore, RedisStore};

/// Exit code when a limit refused the request.
const EXIT_REJECTED: u8 = 2;

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Inspect and exercise shared rate and concurrency limits")]
struct Cli {
    /// YAML configuration file; TOLLGATE__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Check the configuration without touching the store
    Validate,
    /// Show current usage of configured resources
    Status {
        /// Only this resource
        resource: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Consume rate quota for a resource
    Consume {
        resource: String,
        #[arg(short, long, default_value_t = 1)]
        amount: u64,
    },
    /// Take a concurrency slot
    Start { resource: String },
    /// Release a concurrency slot
    End { resource: String },
}

#[derive(Serialize)]
struct ResourceStatus {
    resource: String,
    windows: Vec<WindowStatus>,
    concurrency: Option<SlotStatus>,
}

#[derive(Serialize)]
struct WindowStatus {
    period_secs: u64,
    limit: u64,
    used: u64,
    resets_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SlotStatus {
    limit: u64,
    in_flight: u64,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TollgateConfig> {
    match path {
        Some(path) => TollgateConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => {
            debug!("No configuration file given, using defaults");
            Ok(TollgateConfig::default())
        }
    }
}

/// Limiters connected to the configured store.
struct Limits {
    rate: RateLimiter,
    concurrency: ConcurrencyLimiter,
}

impl Limits {
    async fn connect(config: &TollgateConfig) -> anyhow::Result<Self> {
        let store = RedisStore::connect(&config.store.url, config.store.max_idle_connections)
            .await
            .with_context(|| format!("Failed to connect to {}", config.store.url))?;
        info!(url = %config.store.url, "Connected to store");

        let provider: Arc<dyn ConnectionProvider> = Arc::new(store);
        Ok(Self {
            rate: RateLimiter::from_config(Arc::clone(&provider), config)?,
            concurrency: ConcurrencyLimiter::from_config(provider, config)?,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Validate => validate(&config),
        Command::Status { resource, json } => {
            let limits = Limits::connect(&config).await?;
            status(&limits.rate, &limits.concurrency, resource.as_deref(), json).await
        }
        Command::Consume { resource, amount } => {
            let limits = Limits::connect(&config).await?;
            match limits.rate.consume(&resource, amount).await? {
                Admission::Admitted(txs) => {
                    for tx in &txs {
                        println!(
                            "{}s window: {}/{}",
                            tx.restriction().period_secs(),
                            tx.value(),
                            tx.restriction().limit()
                        );
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Admission::Rejected(rejection) => {
                    println!("rejected: {}", rejection);
                    Ok(ExitCode::from(EXIT_REJECTED))
                }
            }
        }
        Command::Start { resource } => {
            let limits = Limits::connect(&config).await?;
            match limits.concurrency.start_work(&resource).await? {
                Admission::Admitted(in_flight) => {
                    println!("started, {} in flight", in_flight);
                    Ok(ExitCode::SUCCESS)
                }
                Admission::Rejected(rejection) => {
                    println!("rejected: {}", rejection);
                    Ok(ExitCode::from(EXIT_REJECTED))
                }
            }
        }
        Command::End { resource } => {
            let limits = Limits::connect(&config).await?;
            match limits.concurrency.end_work(&resource).await? {
                Release::Released { in_flight } => println!("released, {} in flight", in_flight),
                Release::Expired => println!("counter already expired, nothing released"),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Build every registry against an in-memory store so duplicate and
/// malformed restrictions surface without a server.
fn validate(config: &TollgateConfig) -> anyhow::Result<ExitCode> {
    let provider: Arc<dyn ConnectionProvider> = Arc::new(MemoryStore::new());
    let rate = RateLimiter::from_config(Arc::clone(&provider), config)?;
    let concurrency = ConcurrencyLimiter::from_config(provider, config)?;

    for entry in &config.rate_limits {
        for restriction in rate.restrictions(&entry.resource) {
            println!("{}", restriction);
        }
    }
    for entry in &config.concurrency_limits {
        if let Some(restriction) = concurrency.restriction(&entry.resource) {
            println!("{}", restriction);
        }
    }
    println!("configuration ok");
    Ok(ExitCode::SUCCESS)
}

async fn status(
    rate: &RateLimiter,
    concurrency: &ConcurrencyLimiter,
    only: Option<&str>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let resources: BTreeSet<&str> = match only {
        Some(resource) => BTreeSet::from([resource]),
        None => rate.resources().chain(concurrency.resources()).collect(),
    };

    let now = Utc::now();
    let mut report = Vec::with_capacity(resources.len());
    for resource in resources {
        let windows = if rate.is_restricted(resource) {
            rate.usage(resource)
                .await?
                .into_iter()
                .map(|w| WindowStatus {
                    period_secs: w.period_secs,
                    limit: w.limit,
                    used: w.used,
                    resets_at: w
                        .resets_in
                        .and_then(|d| chrono::Duration::from_std(d).ok())
                        .map(|d| now + d),
                })
                .collect()
        } else {
            Vec::new()
        };

        let slots = match concurrency.restriction(resource) {
            Some(restriction) => Some(SlotStatus {
                limit: restriction.limit(),
                in_flight: concurrency.in_flight(resource).await?,
            }),
            None => None,
        };

        if windows.is_empty() && slots.is_none() {
            anyhow::bail!("No limits configured for resource {}", resource);
        }

        report.push(ResourceStatus {
            resource: resource.to_string(),
            windows,
            concurrency: slots,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    for entry in &report {
        println!("{}", entry.resource);
        for window in &entry.windows {
            let resets = window
                .resets_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:>8}s  {:>6}/{:<6}  resets {}",
                window.period_secs, window.used, window.limit, resets
            );
        }
        if let Some(slots) = &entry.concurrency {
            println!("  in flight {}/{}", slots.in_flight, slots.limit);
        }
    }
    Ok(ExitCode::SUCCESS)
}
