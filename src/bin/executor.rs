//! BridgeBot execution-side daemon.
//!
//! Consumes published opportunities behind per-chain circuit breakers,
//! scans persisted bridge checkpoints for recovery, and polls wallet
//! balances. Concrete RPC clients, bridge routers and the HSM client plug
//! in at the seams; without them the engine runs in dry-run mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bridgebot_backend::bridge::{
    BridgeLatencyPredictor, BridgeRecoveryManager, BridgeRouterFactory, DEFAULT_SAMPLE_MAX_AGE_MS,
};
use bridgebot_backend::bus::{BusClient, RedisBus};
use bridgebot_backend::config::AppConfig;
use bridgebot_backend::execution::{
    BalanceMonitor, CircuitBreakerManager, ExecutionEngine, ExecutionEngineConfig,
};
use bridgebot_backend::lifecycle::{Lifecycle, ServiceState};
use bridgebot_backend::signer::key_id_for_chain;

#[derive(Parser)]
#[command(name = "bridgebot-executor", about = "Cross-chain arbitrage executor")]
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
            error!(error = %e, "executor terminated abnormally");
            ExitCode::from(2)
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!(
        instance = %config.service.instance_id,
        redis = %config.redis.url,
        "bridgebot executor starting"
    );

    let lifecycle = Lifecycle::new("executor");
    lifecycle
        .transition(ServiceState::Starting)
        .context("lifecycle start")?;

    let bus: Arc<dyn BusClient> = Arc::new(
        RedisBus::connect(&config.redis.url)
            .await
            .map_err(|e| anyhow::anyhow!("cannot connect to bus: {e}"))?,
    );

    let breakers = Arc::new(CircuitBreakerManager::new(
        bus.clone(),
        "execution",
        config.service.instance_id.clone(),
        config.breaker_config(),
    ));
    // A restart must not hammer a chain whose breaker was open.
    breakers.restore_from_stream().await;

    let latency = Arc::new(BridgeLatencyPredictor::new());
    // Concrete bridge protocol clients register here when deployed.
    let routers = Arc::new(BridgeRouterFactory::new());
    if routers.is_empty() {
        warn!("no bridge routers configured; recovery will only age out stale bridges");
    }
    let recovery = Arc::new(BridgeRecoveryManager::new(
        bus.clone(),
        routers,
        config.recovery_config(),
        lifecycle.clone(),
    ));

    // Providers and wallets are deployment wiring; none registered here.
    let balances = Arc::new(BalanceMonitor::new(
        config.balance_config(),
        HashMap::new(),
        HashMap::new(),
        lifecycle.clone(),
    ));

    if config.security.kms_signing {
        match key_id_for_chain("ethereum") {
            Some(_) => info!("KMS signing enabled"),
            None => warn!("FEATURE_KMS_SIGNING is on but no KMS_KEY_ID is set"),
        }
    }

    let engine = Arc::new(ExecutionEngine::new(
        bus.clone(),
        breakers.clone(),
        latency.clone(),
        recovery.clone(),
        // The concrete trade executor (signer + RPC submission) is injected
        // in deployments; absent, every opportunity is a dry run.
        None,
        ExecutionEngineConfig {
            consumer: config.service.instance_id.clone(),
            ..ExecutionEngineConfig::default()
        },
        lifecycle.clone(),
    ));
    engine
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("cannot create execution consumer group: {e}"))?;

    lifecycle
        .transition(ServiceState::Running)
        .context("lifecycle run")?;

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };
    let recovery_task = {
        let recovery = recovery.clone();
        tokio::spawn(async move { recovery.run().await })
    };
    let balance_task = {
        let balances = balances.clone();
        tokio::spawn(async move { balances.run().await })
    };
    let housekeeping_task = {
        let latency = latency.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if !lifecycle.is_running() {
                    break;
                }
                latency.cleanup(DEFAULT_SAMPLE_MAX_AGE_MS);
            }
        })
    };

    info!("bridgebot executor running");
    wait_for_shutdown().await;

    info!("shutdown signal received");
    lifecycle
        .transition(ServiceState::Stopping)
        .context("lifecycle stop")?;

    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = engine_task.await;
    })
    .await;
    if drain.is_err() {
        error!("execution loop did not stop inside the shutdown window");
    }
    recovery_task.abort();
    balance_task.abort();
    housekeeping_task.abort();

    lifecycle
        .transition(ServiceState::Stopped)
        .context("lifecycle stopped")?;
    info!("bridgebot executor stopped");
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
