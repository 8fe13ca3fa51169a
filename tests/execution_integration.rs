//! Execution-side flow over the in-memory bus: opportunities consumed behind
//! the chain breakers, bridge checkpoints persisted and recovered, breaker
//! state surviving a restart.

use std::sync::Arc;

use async_trait::async_trait;

use bridgebot_backend::bridge::{
    BridgeChoice, BridgeLatencyPredictor, BridgeRecoveryManager, BridgeRouter,
    BridgeRouterFactory, RecoveryConfig, RouterStatus,
};
use bridgebot_backend::bus::{streams, BusClient, InMemoryBus, BRIDGE_RECOVERY_PREFIX};
use bridgebot_backend::execution::{
    BreakerConfig, CircuitBreakerManager, ExecutionEngine, ExecutionEngineConfig,
    ExecutionReceipt, TradeExecutor,
};
use bridgebot_backend::lifecycle::{Lifecycle, ServiceState};
use bridgebot_backend::models::{now_ms, BridgeRecoveryState, BridgeStatus, OpportunityWire};

struct ScriptedExecutor {
    fail: bool,
}

#[async_trait]
impl TradeExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _opportunity: &OpportunityWire,
        bridge: &BridgeChoice,
    ) -> anyhow::Result<ExecutionReceipt> {
        if self.fail {
            anyhow::bail!("execution reverted");
        }
        Ok(ExecutionReceipt {
            bridge_id: format!("{}-0xsrc", bridge.bridge),
            source_tx_hash: "0xsrc".into(),
            latency_secs: 110.0,
            cost_eth: 0.0012,
        })
    }
}

struct CompletedRouter;

#[async_trait]
impl BridgeRouter for CompletedRouter {
    fn protocol(&self) -> &str {
        "stargate"
    }
    fn supports(&self, _src: &str, _dst: &str, _token: &str) -> bool {
        true
    }
    async fn get_status(&self, _bridge_id: &str) -> anyhow::Result<RouterStatus> {
        Ok(RouterStatus::Completed)
    }
}

fn running_lifecycle() -> Lifecycle {
    let lifecycle = Lifecycle::new("execution-test");
    lifecycle.transition(ServiceState::Starting).unwrap();
    lifecycle.transition(ServiceState::Running).unwrap();
    lifecycle
}

fn opportunity(buy_chain: &str) -> OpportunityWire {
    OpportunityWire {
        kind: "cross-chain".into(),
        buy_chain: buy_chain.into(),
        sell_chain: "arbitrum".into(),
        token_in: "WETH".into(),
        token_out: "USDC".into(),
        bridge_required: true,
        source_price: 2500.0,
        target_price: 2550.0,
        price_diff: 50.0,
        percentage_diff: 2.0,
        estimated_profit: 50.0,
        bridge_cost: 5.0,
        net_profit: 4.85,
        confidence: 0.5,
        created_at: now_ms(),
        whale: None,
        ml: None,
    }
}

fn recovery_manager(bus: Arc<InMemoryBus>, hmac_key: Option<Vec<u8>>) -> Arc<BridgeRecoveryManager> {
    let mut routers = BridgeRouterFactory::new();
    routers.register(Arc::new(CompletedRouter));
    Arc::new(BridgeRecoveryManager::new(
        bus,
        Arc::new(routers),
        RecoveryConfig {
            hmac_key,
            ..RecoveryConfig::default()
        },
        running_lifecycle(),
    ))
}

#[tokio::test]
async fn executed_bridge_is_checkpointed_then_recovered() {
    let bus = Arc::new(InMemoryBus::new());
    let key = b"execution-hmac".to_vec();

    let breakers = Arc::new(CircuitBreakerManager::new(
        bus.clone(),
        "execution",
        "exec-a",
        BreakerConfig::default(),
    ));
    let latency = Arc::new(BridgeLatencyPredictor::new());
    let recovery = recovery_manager(bus.clone(), Some(key.clone()));
    let engine = ExecutionEngine::new(
        bus.clone(),
        breakers.clone(),
        latency.clone(),
        recovery.clone(),
        Some(Arc::new(ScriptedExecutor { fail: false })),
        ExecutionEngineConfig {
            dry_run: false,
            ..ExecutionEngineConfig::default()
        },
        running_lifecycle(),
    );
    engine.init().await.unwrap();

    bus.add(
        streams::OPPORTUNITIES,
        &serde_json::to_value(opportunity("ethereum")).unwrap(),
    )
    .await
    .unwrap();
    engine.poll_cycle().await;

    assert_eq!(engine.stats().executed, 1);
    // The checkpoint landed signed under the bridge id.
    let keys = bus.scan(&format!("{BRIDGE_RECOVERY_PREFIX}*")).await.unwrap();
    assert_eq!(keys.len(), 1);
    // The latency observation entered the chosen route's history; the
    // conservative table picks across for this corridor.
    assert_eq!(latency.sample_count("ethereum", "arbitrum", "across"), 1);

    // A later scan (same instance or another) confirms completion and
    // marks the bridge recovered.
    recovery.clone().scan_once().await;
    assert_eq!(recovery.counters().recovered_bridges, 1);

    // A second scan finds only the terminal state and does nothing more.
    recovery.clone().scan_once().await;
    assert_eq!(recovery.counters().recovered_bridges, 1);
}

#[tokio::test]
async fn breaker_opened_by_failures_survives_restart() {
    let bus = Arc::new(InMemoryBus::new());

    let breakers = Arc::new(CircuitBreakerManager::new(
        bus.clone(),
        "execution",
        "exec-a",
        BreakerConfig::default(),
    ));
    let engine = ExecutionEngine::new(
        bus.clone(),
        breakers.clone(),
        Arc::new(BridgeLatencyPredictor::new()),
        recovery_manager(bus.clone(), None),
        Some(Arc::new(ScriptedExecutor { fail: true })),
        ExecutionEngineConfig {
            dry_run: false,
            ..ExecutionEngineConfig::default()
        },
        running_lifecycle(),
    );

    for _ in 0..5 {
        engine.process(&opportunity("solana")).await;
    }
    assert!(!breakers.can_execute("solana").await);

    // The OPEN event reached the bus; a fresh instance restores it and
    // refuses solana while other chains stay live.
    let restarted = CircuitBreakerManager::new(
        bus.clone(),
        "execution",
        "exec-b",
        BreakerConfig::default(),
    );
    restarted.restore_from_stream().await;
    assert!(!restarted.can_execute("solana").await);
    assert!(restarted.can_execute("ethereum").await);
}

#[tokio::test]
async fn mixed_stream_of_signed_and_foreign_checkpoints() {
    let bus = Arc::new(InMemoryBus::new());
    let key = b"execution-hmac".to_vec();
    let recovery = recovery_manager(bus.clone(), Some(key.clone()));

    // One healthy signed checkpoint, one unsigned interloper.
    recovery
        .persist(&BridgeRecoveryState {
            opportunity_id: "opp-1".into(),
            bridge_id: "good".into(),
            source_tx_hash: "0xsrc".into(),
            source_chain: "ethereum".into(),
            dest_chain: "arbitrum".into(),
            bridge_token: "WETH".into(),
            bridge_amount: "1000000000000000000".into(),
            sell_dex: "sushiswap".into(),
            expected_profit: 10.0,
            token_in: "WETH".into(),
            token_out: "USDC".into(),
            initiated_at: now_ms() - 60_000,
            bridge_protocol: "stargate".into(),
            status: BridgeStatus::Bridging,
            last_check_at: None,
            error_message: None,
        })
        .await;
    bus.set_value(
        &format!("{BRIDGE_RECOVERY_PREFIX}forged"),
        &serde_json::json!({"bridgeId": "forged", "status": "pending"}),
        None,
    )
    .await
    .unwrap();

    recovery.clone().scan_once().await;

    // The signed one advanced; the unsigned one was refused but kept.
    assert_eq!(recovery.counters().recovered_bridges, 1);
    assert!(bus
        .get_value(&format!("{BRIDGE_RECOVERY_PREFIX}forged"))
        .await
        .unwrap()
        .is_some());
}
