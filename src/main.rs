use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde::Deserialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pacer::clock::{Clock, SystemClock};
use pacer::config::{LoggingConfig, PacerConfig};
use pacer::delivery::LogChannel;
use pacer::model::{CampaignId, Recipient};
use pacer::queue::QueueProcessor;
use pacer::ratelimit::{RateLimitSettings, RateLimiter};
use pacer::retry::RetryPolicy;
use pacer::store::{FileStateStore, MemoryStateStore, MemoryStore, StateStore};

#[derive(Debug, Parser)]
#[command(name = "pacer", version, about = "Rate-limited campaign delivery")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a campaign from a YAML file and deliver it
    Send { campaign: PathBuf },
    /// Continue an interrupted or paused campaign
    Resume,
    /// Print queue and rate limiter status
    Status,
    /// List all campaigns
    List,
}

/// Campaign definition read by `pacer send`.
#[derive(Debug, Deserialize)]
struct CampaignFile {
    name: String,
    template: String,
    recipients: Vec<RecipientEntry>,
}

#[derive(Debug, Deserialize)]
struct RecipientEntry {
    address: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    custom_fields: HashMap<String, String>,
    #[serde(default)]
    blocked: bool,
}

impl From<RecipientEntry> for Recipient {
    fn from(entry: RecipientEntry) -> Self {
        let mut recipient = Recipient::new(entry.address);
        recipient.first_name = entry.first_name;
        recipient.last_name = entry.last_name;
        recipient.custom_fields = entry.custom_fields;
        recipient.blocked = entry.blocked;
        recipient
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PacerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let processor = build_processor(&config).await?;

    match cli.command {
        Command::Send { campaign } => {
            let campaign_id = create_from_file(&processor, &campaign).await?;
            processor.start(campaign_id).await?;
            run_until_idle(&processor, campaign_id).await?;
        }
        Command::Resume => {
            let campaign_id = match processor.recover_and_resume().await? {
                Some(id) => id,
                None => match processor.status().current_campaign_id {
                    Some(id) => {
                        processor.resume().await?;
                        id
                    }
                    None => {
                        info!("Nothing to resume");
                        return Ok(());
                    }
                },
            };
            run_until_idle(&processor, campaign_id).await?;
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&processor.status())?);
        }
        Command::List => {
            let campaigns = processor.list_campaigns().await?;
            println!("{}", serde_json::to_string_pretty(&campaigns)?);
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout is reserved for command output.
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn build_processor(config: &PacerConfig) -> anyhow::Result<Arc<QueueProcessor>> {
    let persistence: Arc<dyn StateStore> = match &config.storage.data_dir {
        Some(dir) => {
            info!(data_dir = %dir.display(), "Using file-backed state");
            Arc::new(FileStateStore::open(dir).await?)
        }
        None => {
            warn!("No data_dir configured; state will not survive a restart");
            Arc::new(MemoryStateStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::open(persistence.clone()).await?);
    let settings = RateLimitSettings::from_config(&config.rate_limiting)?;
    let limiter = RateLimiter::load(settings, clock.clone(), persistence.clone()).await?;

    let processor = QueueProcessor::new(
        store,
        Arc::new(LogChannel),
        Arc::new(limiter),
        clock,
        persistence,
    )
    .with_retry_policy(RetryPolicy::from_config(&config.retry))
    .open()
    .await?;

    Ok(processor)
}

async fn create_from_file(
    processor: &QueueProcessor,
    path: &std::path::Path,
) -> anyhow::Result<CampaignId> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file: CampaignFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let campaign = processor.create_campaign(&file.name, &file.template).await?;
    let mut recipient_ids = Vec::with_capacity(file.recipients.len());
    for entry in file.recipients {
        recipient_ids.push(processor.add_recipient(entry.into()).await?);
    }
    let count = processor.enqueue(campaign.id, &recipient_ids).await?;
    info!(campaign_id = %campaign.id, name = %campaign.name, messages = count, "Campaign ready");
    Ok(campaign.id)
}

/// Report progress until the loop exits; Ctrl+C pauses the campaign.
async fn run_until_idle(processor: &Arc<QueueProcessor>, campaign_id: CampaignId) -> anyhow::Result<()> {
    let mut updates = processor.progress_feed().stream().boxed();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = updates.next().await {
            info!(
                sent = progress.sent,
                failed = progress.failed,
                pending = progress.pending,
                percent = progress.percent_complete,
                "Progress"
            );
        }
    });

    let join = processor.join();
    tokio::pin!(join);
    tokio::select! {
        _ = &mut join => {}
        _ = shutdown_signal() => {
            if let Err(e) = processor.pause().await {
                warn!(error = %e, "Could not pause campaign");
            }
            let limiter = processor.limiter();
            info!(
                hourly_remaining = limiter.status().hourly_remaining,
                max_wait_secs = limiter.settings().window.as_secs(),
                "Waiting for the in-flight send slot before exiting"
            );
            join.await;
        }
    }
    reporter.abort();

    let campaign = processor.get_campaign(campaign_id).await?;
    println!("{}", serde_json::to_string_pretty(&campaign)?);
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, pausing campaign");
        }
        _ = terminate => {
            info!("Received SIGTERM, pausing campaign");
        }
    }
}
