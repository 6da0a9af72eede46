//! Mongo Watcher CLI
//!
//! Watches MongoDB change streams and publishes reference events to NATS.

use clap::Parser;
use livequery_core::config::RelayConfig;
use mongo_watcher::{MongoConnector, NatsSink, Relay};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mongo-watcher")]
#[command(about = "MongoDB change-stream relay for livequery")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "LQ_RELAY_CONFIG")]
    config: Option<String>,

    /// NATS server URL (overrides config)
    #[arg(long, env = "NATS_URL")]
    nats_url: Option<String>,

    /// Log level (overrides config)
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format: json or pretty (overrides config)
    #[arg(long, env = "LOG_FORMAT")]
    log_format: Option<String>,

    /// Validate configuration, print the watch plan and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = RelayConfig::load(args.config.as_deref())?;
    if let Some(url) = args.nats_url {
        config.nats.url = url;
    }
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = args.log_format {
        config.observability.log_format = format;
    }

    // Initialize tracing
    let json = config.observability.log_format != "pretty";
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(&config.observability.log_level)
        }))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting mongo-watcher"
    );

    let nats = config.nats.clone();
    let relay = match Relay::new(config, Arc::new(MongoConnector::new())) {
        Ok(relay) => relay,
        Err(e) => {
            error!(error = %e, kind = e.kind(), fatal = e.is_fatal(), "Invalid relay configuration");
            return Err(e.into());
        }
    };

    for target in relay.watch_plan() {
        info!(
            connection = %target.connection,
            database = %target.database,
            collections = ?target.collections,
            "Watching database"
        );
    }

    if args.check {
        info!("Configuration valid");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            cancel.cancel();
        }
    });

    let sink = Arc::new(NatsSink::new(nats));

    if let Err(e) = relay.run(sink, cancel).await {
        error!(error = %e, "Relay failed");
        return Err(e.into());
    }

    info!("Relay stopped gracefully");
    Ok(())
}
