use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{
    BridgeChoice, BridgeLatencyPredictor, BridgeRecoveryManager, BridgeSample, Urgency,
};
use crate::bus::{streams, unwrap_batch, BusClient};
use crate::lifecycle::{Lifecycle, ServiceState};
use crate::models::{now_ms, BridgeRecoveryState, BridgeStatus, OpportunityWire};

use super::circuit_breaker::CircuitBreakerManager;

/// Outcome of the bridge leg a concrete executor ran.
#[derive(Debug, Clone)]
pub struct ExecutionReceipt {
    pub bridge_id: String,
    pub source_tx_hash: String,
    pub latency_secs: f64,
    pub cost_eth: f64,
}

/// Seam for the concrete trade path: DEX calldata, signing, RPC submission.
/// The engine owns the safety rails around it, not the wire format of the
/// transactions themselves.
#[async_trait]
pub trait TradeExecutor: Send + Sync {
    async fn execute(
        &self,
        opportunity: &OpportunityWire,
        bridge: &BridgeChoice,
    ) -> anyhow::Result<ExecutionReceipt>;
}

#[derive(Debug, Clone)]
pub struct ExecutionEngineConfig {
    pub group: String,
    pub consumer: String,
    pub batch: usize,
    pub block_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Reference trade size in tokens for bridge selection.
    pub trade_tokens: f64,
    pub urgency: Urgency,
    /// Log what would happen instead of executing.
    pub dry_run: bool,
}

impl Default for ExecutionEngineConfig {
    fn default() -> Self {
        Self {
            group: "execution".to_string(),
            consumer: "executor-local".to_string(),
            batch: 10,
            block_timeout_ms: 1000,
            poll_interval_ms: 100,
            trade_tokens: 1.0,
            urgency: Urgency::Medium,
            dry_run: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionStats {
    pub consumed: u64,
    pub skipped_by_breaker: u64,
    pub executed: u64,
    pub failed: u64,
    pub dry_runs: u64,
}

/// Consumes published opportunities and runs them through the safety layer:
/// per-chain circuit breaker, bridge-route choice, execution via the trade
/// seam, then feedback into the latency model and recovery checkpoints.
pub struct ExecutionEngine {
    bus: Arc<dyn BusClient>,
    breakers: Arc<CircuitBreakerManager>,
    latency: Arc<BridgeLatencyPredictor>,
    recovery: Arc<BridgeRecoveryManager>,
    executor: Option<Arc<dyn TradeExecutor>>,
    config: ExecutionEngineConfig,
    lifecycle: Lifecycle,
    stats: Mutex<ExecutionStats>,
}

impl ExecutionEngine {
    pub fn new(
        bus: Arc<dyn BusClient>,
        breakers: Arc<CircuitBreakerManager>,
        latency: Arc<BridgeLatencyPredictor>,
        recovery: Arc<BridgeRecoveryManager>,
        executor: Option<Arc<dyn TradeExecutor>>,
        config: ExecutionEngineConfig,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            bus,
            breakers,
            latency,
            recovery,
            executor,
            config,
            lifecycle,
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        *self.stats.lock()
    }

    pub async fn init(&self) -> Result<(), crate::bus::BusError> {
        self.bus
            .create_consumer_group(streams::OPPORTUNITIES, &self.config.group)
            .await
    }

    pub async fn run(&self) {
        loop {
            match self.lifecycle.state() {
                ServiceState::Stopping | ServiceState::Stopped | ServiceState::Error => break,
                ServiceState::Running => self.poll_cycle().await,
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
        debug!("execution engine loop ended");
    }

    pub async fn poll_cycle(&self) {
        let entries = match self
            .bus
            .read_group(
                &self.config.group,
                &self.config.consumer,
                &[streams::OPPORTUNITIES],
                self.config.batch,
                self.config.block_timeout_ms,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.is_timeout() => return,
            Err(e) => {
                warn!(error = %e, "opportunity read failed");
                return;
            }
        };

        for entry in entries {
            for item in unwrap_batch(&entry.data) {
                match serde_json::from_value::<OpportunityWire>(item) {
                    Ok(opportunity) => self.process(&opportunity).await,
                    Err(e) => {
                        warn!(id = %entry.id, error = %e, "discarding undecodable opportunity");
                    }
                }
            }
            if let Err(e) = self
                .bus
                .ack(streams::OPPORTUNITIES, &self.config.group, &entry.id)
                .await
            {
                warn!(id = %entry.id, error = %e, "opportunity ack failed");
            }
        }
    }

    pub async fn process(&self, opportunity: &OpportunityWire) {
        self.stats.lock().consumed += 1;

        if !self.breakers.can_execute(&opportunity.buy_chain).await {
            self.stats.lock().skipped_by_breaker += 1;
            info!(
                chain = %opportunity.buy_chain,
                pair = format!("{}_{}", opportunity.token_in, opportunity.token_out),
                "execution skipped: circuit open"
            );
            return;
        }

        let Some(bridge) = self.latency.predict_optimal_bridge(
            &opportunity.buy_chain,
            &opportunity.sell_chain,
            self.config.trade_tokens,
            self.config.urgency,
            &opportunity.token_in,
        ) else {
            debug!(
                src = %opportunity.buy_chain,
                dst = %opportunity.sell_chain,
                "no bridge route available"
            );
            return;
        };

        let executor = match (&self.executor, self.config.dry_run) {
            (Some(executor), false) => Arc::clone(executor),
            _ => {
                self.stats.lock().dry_runs += 1;
                info!(
                    buy_chain = %opportunity.buy_chain,
                    sell_chain = %opportunity.sell_chain,
                    bridge = %bridge.bridge,
                    net_profit = opportunity.net_profit,
                    "dry run: would execute"
                );
                return;
            }
        };

        let started = now_ms();
        match executor.execute(opportunity, &bridge).await {
            Ok(receipt) => {
                self.stats.lock().executed += 1;
                self.breakers.record_success(&opportunity.buy_chain).await;
                self.latency.update_model(
                    &opportunity.buy_chain,
                    &opportunity.sell_chain,
                    &bridge.bridge,
                    BridgeSample {
                        latency_secs: receipt.latency_secs,
                        cost_eth: receipt.cost_eth,
                        success: true,
                        timestamp: now_ms(),
                        congestion_level: 0.0,
                        gas_price: 0.0,
                    },
                );
                self.recovery
                    .persist(&BridgeRecoveryState {
                        opportunity_id: format!(
                            "{}-{}-{}",
                            opportunity.token_in, opportunity.buy_chain, opportunity.created_at
                        ),
                        bridge_id: receipt.bridge_id.clone(),
                        source_tx_hash: receipt.source_tx_hash.clone(),
                        source_chain: opportunity.buy_chain.clone(),
                        dest_chain: opportunity.sell_chain.clone(),
                        bridge_token: opportunity.token_in.clone(),
                        bridge_amount: format!("{}", (self.config.trade_tokens * 1e18) as u128),
                        sell_dex: String::new(),
                        expected_profit: opportunity.net_profit,
                        token_in: opportunity.token_in.clone(),
                        token_out: opportunity.token_out.clone(),
                        initiated_at: started,
                        bridge_protocol: bridge.bridge.clone(),
                        status: BridgeStatus::Bridging,
                        last_check_at: None,
                        error_message: None,
                    })
                    .await;
                info!(
                    bridge_id = %receipt.bridge_id,
                    chain = %opportunity.buy_chain,
                    "bridge leg executed"
                );
            }
            Err(e) => {
                self.stats.lock().failed += 1;
                self.breakers
                    .record_failure(&opportunity.buy_chain, &e.to_string())
                    .await;
                self.latency.update_model(
                    &opportunity.buy_chain,
                    &opportunity.sell_chain,
                    &bridge.bridge,
                    BridgeSample {
                        latency_secs: (now_ms() - started) as f64 / 1000.0,
                        cost_eth: 0.0,
                        success: false,
                        timestamp: now_ms(),
                        congestion_level: 0.0,
                        gas_price: 0.0,
                    },
                );
                warn!(chain = %opportunity.buy_chain, error = %e, "execution failed");
            }
        }
    }
}
