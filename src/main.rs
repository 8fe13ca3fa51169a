//! BridgeBot detector daemon.
//!
//! Consumes price, whale and pending-intent streams off the bus, runs the
//! cross-chain detection engine, and publishes validated opportunities for
//! the execution side.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridgebot_backend::bridge::{BridgeLatencyPredictor, DEFAULT_SAMPLE_MAX_AGE_MS};
use bridgebot_backend::bus::{BusClient, RedisBus};
use bridgebot_backend::config::AppConfig;
use bridgebot_backend::detector::{
    CrossChainDetector, OpportunityPublisher, PreValidationOrchestrator, PredictorBridgeCost,
    PriceDataManager, WhaleFlowTracker,
};
use bridgebot_backend::lifecycle::{Lifecycle, ServiceState};
use bridgebot_backend::ml::MlPredictionManager;
use bridgebot_backend::streams::{StreamConsumer, StreamEvent};

#[derive(Parser)]
#[command(name = "bridgebot", about = "Cross-chain arbitrage detector")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "detector terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        instance = %config.service.instance_id,
        redis = %config.redis.url,
        "bridgebot detector starting"
    );

    let lifecycle = Lifecycle::new("detector");
    lifecycle
        .transition(ServiceState::Starting)
        .context("lifecycle start")?;

    let bus: Arc<dyn BusClient> = Arc::new(
        RedisBus::connect(&config.redis.url)
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to bus: {e}"))?,
    );

    let prices = Arc::new(PriceDataManager::with_default_retention());
    let whales = Arc::new(WhaleFlowTracker::with_default_window());
    // No model wired in this deployment; prediction plumbing stays dormant.
    let ml = Arc::new(MlPredictionManager::disabled());
    let latency = Arc::new(BridgeLatencyPredictor::new());
    let publisher = Arc::new(OpportunityPublisher::new(
        bus.clone(),
        config.publisher_config(),
    ));
    let prevalidation = Arc::new(PreValidationOrchestrator::new(config.prevalidation_config()));

    let detector = Arc::new(CrossChainDetector::new(
        config.detector_config(),
        prices.clone(),
        whales,
        ml,
        Arc::new(PredictorBridgeCost::new(
            latency.clone(),
            config.detector.eth_price_usd,
        )),
        publisher,
        prevalidation,
        lifecycle.clone(),
    ));

    let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(1024);
    let consumer = Arc::new(StreamConsumer::new(
        bus.clone(),
        config.consumer_config(),
        lifecycle.clone(),
        event_tx,
    ));
    consumer
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("cannot create consumer groups: {e}"))?;

    lifecycle
        .transition(ServiceState::Running)
        .context("lifecycle run")?;

    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run().await })
    };
    let detector_task = {
        let detector = detector.clone();
        tokio::spawn(async move { detector.run().await })
    };
    let dispatch_task = {
        let detector = detector.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                detector.handle_event(event).await;
            }
        })
    };
    let housekeeping_task = {
        let prices = prices.clone();
        let latency = latency.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if !lifecycle.is_running() {
                    break;
                }
                prices.cleanup();
                latency.cleanup(DEFAULT_SAMPLE_MAX_AGE_MS);
            }
        })
    };

    info!("bridgebot detector running");
    wait_for_shutdown().await;

    info!("shutdown signal received");
    lifecycle
        .transition(ServiceState::Stopping)
        .context("lifecycle stop")?;

    // Give the loops one interval to notice, then let the process exit.
    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = consumer_task.await;
        let _ = detector_task.await;
    })
    .await;
    if drain.is_err() {
        error!("tasks did not stop inside the shutdown window");
    }
    dispatch_task.abort();
    housekeeping_task.abort();

    lifecycle
        .transition(ServiceState::Stopped)
        .context("lifecycle stopped")?;
    info!("bridgebot detector stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
