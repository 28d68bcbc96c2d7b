use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rov_stream_processor::config::Config;
use rov_stream_processor::metrics;
use rov_stream_processor::mqtt::publisher::{BrokerCredentials, MqttPublisher};
use rov_stream_processor::mqtt::schema::{default_schemas_dir, SchemaSet};
use rov_stream_processor::telemetry;
use rov_stream_processor::video::feed::spawn_feed;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Schema directory override. Default: schemas/ next to the binary.
    #[arg(long)]
    schemas_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();
    info!(config = %args.config.display(), "Starting ROV stream processor");

    // Startup misconfiguration is fatal: config, schemas, then broker
    let config = Config::from_file(&args.config)?;

    let schemas_dir = args.schemas_dir.unwrap_or_else(default_schemas_dir);
    let schemas = Arc::new(
        SchemaSet::load_dir(&schemas_dir)
            .with_context(|| format!("loading schemas from {}", schemas_dir.display()))?,
    );

    let base_topic = config.telemetry.base_topic.clone();
    let output_schema = schemas
        .for_topic(&base_topic)
        .with_context(|| format!("no schema for base topic {base_topic}"))?
        .raw
        .clone();

    let creds = BrokerCredentials::from_env().context("broker credentials")?;
    let publisher = Arc::new(
        MqttPublisher::connect(&creds, Arc::clone(&schemas))
            .await
            .context("connecting to broker")?,
    );

    let running = Arc::new(AtomicBool::new(true));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Video relays, one set of workers per configured feed
    let mut feeds = Vec::new();
    for feed in config.feeds() {
        let handles = spawn_feed(
            feed,
            &config.network,
            Arc::clone(&running),
            shutdown_rx.clone(),
        )
        .await?;
        feeds.push(handles);
    }
    info!(feeds = feeds.len(), "Video relay started");

    // Telemetry pipeline
    let telemetry_handles = telemetry::processor::start(
        config.telemetry.clone(),
        output_schema,
        Arc::clone(&publisher),
        Arc::clone(&running),
        shutdown_rx.clone(),
    );

    // Memory sampler
    let sampler = tokio::spawn(metrics::run_sampler(
        config.metrics.memory_threshold_mb,
        Arc::clone(&running),
        shutdown_rx.clone(),
    ));

    info!("All workers running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for signal")?;
    info!("Interrupt received, shutting down");

    // Orderly shutdown: flip the flag first, then join the workers
    running.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);

    for feed in feeds {
        if let Err(e) = feed.decoder.await {
            error!(stream_id = feed.id, error = %e, "Decoder task join failed");
        }
        if let Err(e) = feed.encoder.await {
            error!(stream_id = feed.id, error = %e, "Encoder task join failed");
        }
    }

    let _ = telemetry_handles.publish_loop.await;
    let _ = telemetry_handles.receiver.await;
    let _ = sampler.await;

    info!("Shutdown complete");
    Ok(())
}
