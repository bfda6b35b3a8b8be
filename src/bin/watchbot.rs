use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use mercari_watch::api::MercariClient;
use mercari_watch::config::{AppConfig, CONFIG_PATH};
use mercari_watch::engine::{CycleReport, PollEngine};
use mercari_watch::notify::DiscordSink;
use mercari_watch::store::{EntryStore, PgEntryStore};
use mercari_watch::token::DpopIssuer;

#[derive(Parser)]
#[command(name = "watchbot", about = "Mercari keyword watcher bot")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Run a single polling cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    info!("Loaded config from {}", args.config.display());

    let store = PgEntryStore::connect(&config.database.url).await?;
    store.ensure_schema().await?;

    let mut engine = PollEngine::new(
        MercariClient::new(),
        store,
        DiscordSink::new(config.discord.bot_token.clone()),
        DpopIssuer::new(),
        config.settings.watermark_advance,
    );

    if args.once {
        let report = engine.run_cycle().await;
        log_cycle(&report);
        log_status(engine.store()).await;
        return Ok(());
    }

    let poll_interval_secs = config.settings.poll_interval_secs;
    info!("Entering polling loop (interval: {poll_interval_secs}s). Press Ctrl+C to stop.");
    let poll_duration = Duration::from_secs(poll_interval_secs);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = tokio::time::sleep(poll_duration) => {
                let report = engine.run_cycle().await;
                log_cycle(&report);
                log_status(engine.store()).await;
            }
        }
    }

    Ok(())
}

fn log_cycle(report: &CycleReport) {
    // An abandoned cycle was already logged by the engine
    if report.aborted.is_none() {
        info!(
            "Cycle complete: {} entries, {} notified, {} skipped",
            report.outcomes.len(),
            report.total_notified(),
            report.total_skipped(),
        );
    }
}

async fn log_status<S: EntryStore>(store: &S) {
    match store.aggregate_counts().await {
        Ok(counts) => info!(
            "Watching {} terms for {} channels",
            counts.total_entries, counts.unique_channels,
        ),
        Err(error) => warn!("Failed to aggregate entry counts: {error:#}"),
    }
}
