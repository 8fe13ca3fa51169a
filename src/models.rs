use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Per-stage timestamps stamped onto a price update as it moves through the
/// pipeline. All values are epoch milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineTimestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourced_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<i64>,
}

/// A single DEX pool price observation from one chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceUpdate {
    pub chain: String,
    pub dex: String,
    /// Canonical `"TOKEN0_TOKEN1"` or DEX-prefixed `"DEX_TOKEN0_TOKEN1"`.
    pub pair_key: String,
    pub token0: String,
    pub token1: String,
    pub price: f64,
    #[serde(default)]
    pub reserve0: f64,
    #[serde(default)]
    pub reserve1: f64,
    #[serde(default)]
    pub block_number: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub latency: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_timestamps: Option<PipelineTimestamps>,
}

/// Whale trade direction on the observed venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhaleDirection {
    Buy,
    Sell,
}

impl WhaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhaleDirection::Buy => "buy",
            WhaleDirection::Sell => "sell",
        }
    }
}

/// A large on-chain trade worth tracking for flow analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleTransaction {
    pub chain: String,
    pub token: String,
    pub direction: WhaleDirection,
    pub usd_value: f64,
    pub amount: f64,
    pub address: String,
    pub transaction_hash: String,
    #[serde(default)]
    pub dex: String,
    #[serde(default)]
    pub impact: f64,
    pub timestamp: i64,
}

/// A decoded mempool swap intent, pre-confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapIntent {
    pub hash: String,
    pub router: String,
    #[serde(rename = "type")]
    pub intent_type: String,
    pub token_in: String,
    pub token_out: String,
    pub sender: String,
    pub chain_id: u64,
    /// Unix seconds the swap must be mined by.
    pub deadline: i64,
    pub nonce: u64,
    pub slippage_tolerance: f64,
    /// Decimal string, wei.
    pub gas_price: String,
    /// Decimal string, token base units.
    pub amount_in: String,
    /// Decimal string, token base units.
    pub expected_amount_out: String,
    pub path: Vec<String>,
    pub first_seen: i64,
}

/// Wire envelope for a mempool intent published to the pending stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOpportunity {
    #[serde(rename = "type")]
    pub kind: String,
    pub intent: SwapIntent,
    pub published_at: i64,
}

/// Aggregated whale flow for one token over the tracker window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleSummary {
    /// "bullish" | "bearish" | "neutral".
    pub direction: String,
    pub net_flow_usd: f64,
    pub super_whale_count: u32,
    pub transaction_count: u32,
}

/// Model output attached to an opportunity when a predictor is wired in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    /// "up" | "down" | "flat".
    pub direction: String,
    /// Signed confidence in [-1, 1]; sign tracks direction agreement.
    pub confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_price: Option<f64>,
}

/// Extra context when an opportunity was triggered by a mempool intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTrigger {
    pub intent_hash: String,
    pub sender: String,
    pub slippage_tolerance: f64,
}

/// A detected buy-low / sell-high pair across two chains.
///
/// `percentage_diff` is expressed in percent (2.0 == 2%), converted from the
/// internal ratio exactly once when the struct is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainOpportunity {
    /// Normalized token pair, e.g. `"WETH_USDC"`.
    pub pair: String,
    pub token_in: String,
    pub token_out: String,
    pub buy_chain: String,
    pub buy_dex: String,
    pub buy_price: f64,
    pub sell_chain: String,
    pub sell_dex: String,
    pub sell_price: f64,
    pub price_diff: f64,
    pub percentage_diff: f64,
    pub estimated_profit: f64,
    pub bridge_cost: f64,
    pub net_profit: f64,
    pub confidence: f64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_size_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whale: Option<WhaleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml: Option<Prediction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingTrigger>,
}

impl CrossChainOpportunity {
    /// Canonical published form (`stream:opportunities`).
    pub fn wire(&self) -> OpportunityWire {
        OpportunityWire {
            kind: "cross-chain".to_string(),
            buy_chain: self.buy_chain.clone(),
            sell_chain: self.sell_chain.clone(),
            token_in: self.token_in.clone(),
            token_out: self.token_out.clone(),
            bridge_required: true,
            source_price: self.buy_price,
            target_price: self.sell_price,
            price_diff: self.price_diff,
            percentage_diff: self.percentage_diff,
            estimated_profit: self.estimated_profit,
            bridge_cost: self.bridge_cost,
            net_profit: self.net_profit,
            confidence: self.confidence,
            created_at: self.created_at,
            whale: self.whale.clone(),
            ml: self.ml.clone(),
        }
    }
}

/// Published opportunity message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityWire {
    #[serde(rename = "type")]
    pub kind: String,
    pub buy_chain: String,
    pub sell_chain: String,
    pub token_in: String,
    pub token_out: String,
    pub bridge_required: bool,
    pub source_price: f64,
    pub target_price: f64,
    pub price_diff: f64,
    /// Percent, not ratio: consumers divide by 100.
    pub percentage_diff: f64,
    pub estimated_profit: f64,
    pub bridge_cost: f64,
    pub net_profit: f64,
    pub confidence: f64,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub whale: Option<WhaleSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml: Option<Prediction>,
}

/// Lifecycle of an interrupted bridge execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeStatus {
    Pending,
    Bridging,
    BridgeCompletedSellPending,
    Recovered,
    Failed,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeStatus::Pending => "pending",
            BridgeStatus::Bridging => "bridging",
            BridgeStatus::BridgeCompletedSellPending => "bridge_completed_sell_pending",
            BridgeStatus::Recovered => "recovered",
            BridgeStatus::Failed => "failed",
        }
    }

    /// Whether the recovery scanner still has work to do on this state.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            BridgeStatus::Pending | BridgeStatus::Bridging | BridgeStatus::BridgeCompletedSellPending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BridgeStatus::Recovered | BridgeStatus::Failed)
    }
}

/// Persisted checkpoint for an in-flight bridge leg, written before the
/// source transaction is sent so a crashed executor can pick it back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRecoveryState {
    pub opportunity_id: String,
    pub bridge_id: String,
    pub source_tx_hash: String,
    pub source_chain: String,
    pub dest_chain: String,
    pub bridge_token: String,
    /// Decimal string, token base units.
    pub bridge_amount: String,
    pub sell_dex: String,
    pub expected_profit: f64,
    pub token_in: String,
    pub token_out: String,
    pub initiated_at: i64,
    pub bridge_protocol: String,
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One wallet's native balance as of the last monitor cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainBalance {
    pub chain: String,
    pub address: String,
    /// Decimal string, wei.
    pub balance_wei: String,
    pub balance_eth: f64,
    pub last_checked_at: i64,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Circuit breaker state-change event (`stream:circuit-breaker`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerEvent {
    pub service: String,
    pub instance_id: String,
    pub chain: String,
    pub previous_state: String,
    pub new_state: String,
    pub reason: String,
    pub timestamp: i64,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_update_round_trips_camel_case() {
        let json = r#"{
            "chain": "ethereum",
            "dex": "uniswap",
            "pairKey": "UNISWAP_WETH_USDC",
            "token0": "WETH",
            "token1": "USDC",
            "price": 2500.0,
            "reserve0": 100.0,
            "reserve1": 250000.0,
            "blockNumber": 19000000,
            "timestamp": 1700000000000,
            "latency": 12.5
        }"#;
        let update: PriceUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.pair_key, "UNISWAP_WETH_USDC");
        assert_eq!(update.block_number, 19_000_000);

        let back = serde_json::to_value(&update).unwrap();
        assert_eq!(back["pairKey"], "UNISWAP_WETH_USDC");
        assert_eq!(back["blockNumber"], 19_000_000);
        assert!(back.get("pipelineTimestamps").is_none());
    }

    #[test]
    fn opportunity_wire_shape() {
        let opp = CrossChainOpportunity {
            pair: "WETH_USDC".into(),
            token_in: "WETH".into(),
            token_out: "USDC".into(),
            buy_chain: "ethereum".into(),
            buy_dex: "uniswap".into(),
            buy_price: 2500.0,
            sell_chain: "arbitrum".into(),
            sell_dex: "sushiswap".into(),
            sell_price: 2550.0,
            price_diff: 50.0,
            percentage_diff: 2.0,
            estimated_profit: 50.0,
            bridge_cost: 5.0,
            net_profit: 4.85,
            confidence: 0.8,
            created_at: 1_700_000_000_000,
            trade_size_usd: None,
            whale: None,
            ml: None,
            pending: None,
        };
        let wire = serde_json::to_value(opp.wire()).unwrap();
        assert_eq!(wire["type"], "cross-chain");
        assert_eq!(wire["bridgeRequired"], true);
        assert_eq!(wire["percentageDiff"], 2.0);
        assert_eq!(wire["buyChain"], "ethereum");
    }

    #[test]
    fn bridge_status_strings() {
        assert_eq!(
            serde_json::to_string(&BridgeStatus::BridgeCompletedSellPending).unwrap(),
            "\"bridge_completed_sell_pending\""
        );
        assert!(BridgeStatus::Pending.is_actionable());
        assert!(!BridgeStatus::Recovered.is_actionable());
        assert!(BridgeStatus::Failed.is_terminal());
    }

    #[test]
    fn whale_direction_parses_lowercase() {
        let tx: WhaleTransaction = serde_json::from_str(
            r#"{
                "chain": "ethereum",
                "token": "WETH",
                "direction": "sell",
                "usdValue": 1500000.0,
                "amount": 600.0,
                "address": "0xabc",
                "transactionHash": "0xdef",
                "timestamp": 1700000000000
            }"#,
        )
        .unwrap();
        assert_eq!(tx.direction, WhaleDirection::Sell);
        assert_eq!(tx.direction.as_str(), "sell");
    }
}
