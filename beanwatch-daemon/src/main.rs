//! Beanwatch daemon
//!
//! Watches indexed Beanstalk protocol data for notifiable events (peg
//! crosses, seasons, well swaps, contract activity) and fans them out to
//! the configured notification channels.

mod channels;
mod config;
mod shutdown;

use beanwatch_core::classify::{
    ContractActivityClassifier, PegCrossClassifier, SeasonClassifier, StreamClassifier,
    WellSwapClassifier,
};
use beanwatch_core::dispatch::{Dispatcher, NotifyChannel, RetryPolicy};
use beanwatch_core::runner::StreamRunner;
use beanwatch_core::source::{
    ContractTxSource, DataSource, PriceSource, SeasonSource, SubgraphClient, WellSwapSource,
};
use beanwatch_core::store::{MemoryStateStore, PgStateStore, StateStore};
use channels::{DiscordWebhookChannel, TelegramChannel};
use clap::Parser;
use config::{ChannelConfig, FileConfig};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Beanwatch - protocol event notification daemon
#[derive(Parser, Debug)]
#[command(name = "beanwatch-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./beanwatch.toml")]
    config: PathBuf,

    /// Keep state in memory instead of the database (nothing survives a
    /// restart; intended for local testing)
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    tracing::info!("Starting beanwatch-daemon v{}", env!("CARGO_PKG_VERSION"));

    let raw = std::fs::read_to_string(&args.config).map_err(|e| {
        tracing::error!("Failed to read configuration file {:?}: {}", args.config, e);
        e
    })?;
    let file_config: FileConfig = toml::from_str(&raw).map_err(|e| {
        tracing::error!("Failed to parse configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    // State store: Postgres unless this is a dry run.
    let store: Arc<dyn StateStore> = if args.dry_run {
        tracing::warn!("Dry run: stream state is held in memory only");
        Arc::new(MemoryStateStore::new())
    } else {
        let database_url = std::env::var("DATABASE_URL").map_err(|e| {
            tracing::error!("DATABASE_URL environment variable not set");
            anyhow::anyhow!(e)
        })?;
        tracing::info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to database: {}", e);
                e
            })?;
        let pg = PgStateStore::new(pool);
        pg.ensure_schema().await?;
        tracing::info!("Database connection established");
        Arc::new(pg)
    };

    let dispatcher = Arc::new(Dispatcher::new(
        build_channels(&file_config, &http),
        RetryPolicy {
            max_attempts: file_config.dispatch.max_attempts,
            base_delay: Duration::from_secs(file_config.dispatch.base_delay_secs),
            max_delay: Duration::from_secs(file_config.dispatch.max_delay_secs),
        },
    ));

    let runners = build_runners(&file_config, &http, dispatcher, store)?;
    if runners.is_empty() {
        anyhow::bail!("no streams enabled in configuration");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for runner in runners {
        handles.push(tokio::spawn(runner.run(shutdown_rx.clone())));
    }
    tracing::info!("Spawned {} stream runners", handles.len());

    shutdown::shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Daemon shutdown complete");

    Ok(())
}

/// Build the configured notification channels.
fn build_channels(config: &FileConfig, http: &reqwest::Client) -> Vec<Arc<dyn NotifyChannel>> {
    let mut channels: Vec<Arc<dyn NotifyChannel>> = Vec::new();
    for channel in &config.channels {
        match channel {
            ChannelConfig::Discord {
                id,
                webhook_url,
                events,
            } => {
                channels.push(Arc::new(DiscordWebhookChannel::new(
                    id.clone(),
                    webhook_url.clone(),
                    events.iter().copied().collect(),
                    http.clone(),
                )));
            }
            ChannelConfig::Telegram {
                id,
                bot_token,
                chat_id,
                events,
            } => {
                channels.push(Arc::new(TelegramChannel::new(
                    id.clone(),
                    bot_token,
                    chat_id.clone(),
                    events.iter().copied().collect(),
                    http.clone(),
                )));
            }
        }
    }
    channels
}

/// Build a runner per enabled stream.
fn build_runners(
    config: &FileConfig,
    http: &reqwest::Client,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
) -> anyhow::Result<Vec<StreamRunner>> {
    let mut runners = Vec::new();

    if let Some(peg) = config.streams.peg_cross.as_ref().filter(|s| s.common.enabled) {
        let client = SubgraphClient::new(config.sources.bean_subgraph.clone(), http.clone());
        runners.push(StreamRunner::new(
            peg.common.to_stream_config("peg-cross"),
            Box::new(PriceSource::new(client)) as Box<dyn DataSource>,
            StreamClassifier::PegCross(PegCrossClassifier { peg: peg.peg }),
            dispatcher.clone(),
            store.clone(),
        ));
    }

    if let Some(season) = config.streams.season.as_ref().filter(|s| s.common.enabled) {
        let client = SubgraphClient::new(config.sources.beanstalk_subgraph.clone(), http.clone());
        runners.push(StreamRunner::new(
            season.common.to_stream_config("season"),
            Box::new(SeasonSource::new(client)),
            StreamClassifier::Season(SeasonClassifier),
            dispatcher.clone(),
            store.clone(),
        ));
    }

    if let Some(swap) = config.streams.well_swap.as_ref().filter(|s| s.common.enabled) {
        let client = SubgraphClient::new(config.sources.basin_subgraph.clone(), http.clone());
        runners.push(StreamRunner::new(
            swap.common.to_stream_config("well-swap"),
            Box::new(WellSwapSource::new(client)),
            StreamClassifier::WellSwap(WellSwapClassifier {
                min_swap_usd: swap.min_swap_usd,
            }),
            dispatcher.clone(),
            store.clone(),
        ));
    }

    if let Some(activity) = config
        .streams
        .contract_activity
        .as_ref()
        .filter(|s| s.common.enabled)
    {
        let etherscan = config.sources.etherscan.as_ref().ok_or_else(|| {
            anyhow::anyhow!("contract_activity stream enabled but [sources.etherscan] is missing")
        })?;
        runners.push(StreamRunner::new(
            activity.common.to_stream_config("contract-activity"),
            Box::new(ContractTxSource::new(
                etherscan.chain_id,
                etherscan.contract_address.clone(),
                etherscan.api_key.clone(),
                http.clone(),
            )),
            StreamClassifier::ContractActivity(ContractActivityClassifier {
                methods: activity.methods.iter().cloned().collect(),
            }),
            dispatcher.clone(),
            store.clone(),
        ));
    }

    Ok(runners)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,hyper=warn,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
