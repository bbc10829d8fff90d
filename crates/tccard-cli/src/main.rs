use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tccard_analytics::{Collector, DeliveryError, EventCounterStore, HttpCollector};
use tccard_core::{
    ContactMessage, CounterAction, DeliveryPayload, ProfileIdentifier, ShareLinks, SharePlatform,
};
use tccard_resolver::contact::ContactFormClient;
use tccard_resolver::{load_source_registry, ProfileResolver, ResolveError};
use tccard_storage::{FileKeyValueStore, HttpFetcher, KeyValueStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;

use config::TccardConfig;

#[derive(Debug, Parser)]
#[command(name = "tccard")]
#[command(about = "Total Connect digital card client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Look up a profile by routing token (`jane`, `@jane`, `#id_42`).
    Resolve {
        token: String,
        /// Query every source at once and keep the first valid answer.
        #[arg(long)]
        parallel: bool,
        /// Print per-source attempts instead of the record.
        #[arg(long, conflicts_with = "parallel")]
        report: bool,
    },
    /// Record one analytics event for a profile link.
    Track {
        link: String,
        action: CounterAction,
        detail: Option<String>,
    },
    /// Show the saved counters and pending deliveries for a profile link.
    Stats {
        link: String,
    },
    /// Retry queued deliveries once.
    Drain {
        link: String,
    },
    /// Print the share URLs for a profile link.
    Share {
        link: String,
        #[arg(long)]
        platform: Option<SharePlatform>,
    },
    /// Send a message to a profile owner through the contact form.
    Contact {
        token: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        message: String,
    },
}

/// Stand-in used when no collector URL is configured; every event stays queued.
struct Unconfigured;

#[async_trait]
impl Collector for Unconfigured {
    async fn deliver(&self, _payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        Err(DeliveryError::Rejected(
            "TCCARD_COLLECTOR_URL is not set".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tccard=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = TccardConfig::from_env();

    match cli.command {
        Commands::Resolve {
            token,
            parallel,
            report,
        } => {
            let resolver = build_resolver(&config)?;
            let identifier = ProfileIdentifier::from_routing_token(&token)
                .map_err(ResolveError::from)
                .map_err(explain)?;
            if report {
                let (outcome, report) = resolver.resolve_with_report(&identifier).await;
                println!("{}", serde_json::to_string_pretty(&report)?);
                outcome.map_err(explain)?;
            } else {
                let record = if parallel {
                    resolver.resolve_parallel(&identifier).await
                } else {
                    resolver.resolve(&identifier).await
                }
                .map_err(explain)?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
        }
        Commands::Track {
            link,
            action,
            detail,
        } => {
            let store = open_store(&config, &link)?;
            let recorded = store.record_event(action, detail.as_deref())?;
            let counted = recorded.counted();
            recorded.settled().await;
            println!(
                "{action} {}: queued={}",
                if counted { "recorded" } else { "skipped (cool-down)" },
                store.retry_queue().len()
            );
            println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
        }
        Commands::Stats { link } => {
            let store = open_store(&config, &link)?;
            println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
            println!("queued deliveries: {}", store.retry_queue().len());
        }
        Commands::Drain { link } => {
            let store = open_store(&config, &link)?;
            let report = store.drain_retry_queue().await;
            println!(
                "drain complete: attempted={} delivered={} remaining={}",
                report.attempted, report.delivered, report.remaining
            );
        }
        Commands::Share { link, platform } => {
            let links = ShareLinks::new(&config.card_base_url, link.trim_start_matches('@'));
            match platform {
                Some(platform) => println!("{}", links.for_platform(platform)),
                None => {
                    println!("profile: {}", links.profile_url);
                    for platform in SharePlatform::ALL {
                        println!("{}: {}", platform.as_str(), links.for_platform(platform));
                    }
                }
            }
        }
        Commands::Contact {
            token,
            name,
            email,
            phone,
            message,
        } => {
            let endpoint = config
                .contact_form_url
                .clone()
                .context("TCCARD_CONTACT_FORM_URL is not set")?;
            let record = build_resolver(&config)?
                .resolve_token(&token)
                .await
                .map_err(explain)?;
            let Some(recipient) = record.contact_form_recipient.clone().or(record.email.clone())
            else {
                bail!("{} has no contact address", record.name);
            };
            let link = record.link.as_deref().unwrap_or(token.trim_start_matches(['#', '@']));
            let profile_url = ShareLinks::new(&config.card_base_url, link).profile_url;

            let client = ContactFormClient::new(HttpFetcher::new(config.http_client())?, endpoint);
            let message = ContactMessage {
                name,
                email,
                phone,
                message,
            };
            client.submit(&message, &recipient, &profile_url).await?;
            println!("message sent to {}", record.name);

            let store = open_store(&config, link)?;
            store
                .record_event(CounterAction::Contact, None)?
                .settled()
                .await;
        }
    }

    Ok(())
}

fn explain(err: ResolveError) -> anyhow::Error {
    match err.last_failure_code() {
        Some(cause) => anyhow::anyhow!("{} [{}: {}]", err.user_message(), err.reason_code(), cause),
        None => anyhow::anyhow!("{} [{}]", err.user_message(), err.reason_code()),
    }
}

fn build_resolver(config: &TccardConfig) -> Result<ProfileResolver> {
    let sources = load_source_registry(&config.sources_file)?;
    ProfileResolver::new(sources, config.http_client())
}

fn open_store(config: &TccardConfig, link: &str) -> Result<EventCounterStore> {
    let link = link.trim().trim_start_matches('@');
    if link.is_empty() {
        bail!("no profile link provided");
    }
    let kv: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(&config.state_dir));
    let collector: Arc<dyn Collector> = match &config.collector_url {
        Some(url) => Arc::new(HttpCollector::new(
            HttpFetcher::new(config.http_client())?,
            url,
        )),
        None => Arc::new(Unconfigured),
    };
    EventCounterStore::open(link, kv, collector, config.counter_store())
        .with_context(|| format!("opening counters for {link}"))
}
