use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use num_bigint::BigUint;
use tracing::{debug, info};

use crate::bridge::BridgeChoice;
use crate::models::OpportunityWire;
use crate::signer::eth::{parse_address, LegacyTransaction};
use crate::signer::KmsSigner;

use super::engine::{ExecutionReceipt, TradeExecutor};

/// Thin RPC seam for the chains we execute on. Concrete JSON-RPC clients
/// implement this; the executor never sees a URL.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn next_nonce(&self, chain: &str, address: &str) -> anyhow::Result<u64>;

    /// Current gas price in wei.
    async fn gas_price(&self, chain: &str) -> anyhow::Result<BigUint>;

    /// Submit a raw signed transaction; returns the transaction hash.
    async fn send_raw_transaction(&self, chain: &str, raw: &[u8]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct TransferExecutorConfig {
    /// Deposit address per `"{chain}:{bridge}"` route leg.
    pub deposit_addresses: HashMap<String, String>,
    /// EVM chain id per chain name.
    pub chain_ids: HashMap<String, u64>,
    pub gas_limit: u64,
    /// Native value bridged per execution, in whole tokens.
    pub trade_tokens: f64,
}

impl Default for TransferExecutorConfig {
    fn default() -> Self {
        let chain_ids = [
            ("ethereum", 1u64),
            ("optimism", 10),
            ("bsc", 56),
            ("polygon", 137),
            ("base", 8453),
            ("arbitrum", 42161),
            ("avalanche", 43114),
        ]
        .into_iter()
        .map(|(chain, id)| (chain.to_string(), id))
        .collect();
        Self {
            deposit_addresses: HashMap::new(),
            chain_ids,
            gas_limit: 150_000,
            trade_tokens: 1.0,
        }
    }
}

/// Executes the bridge leg as a signed native-value deposit into the bridge
/// router. Token-swap calldata belongs to the DEX encoders upstream; this
/// covers the transfer leg every bridge has in common.
pub struct TransferExecutor {
    signer: Arc<KmsSigner>,
    client: Arc<dyn ChainClient>,
    config: TransferExecutorConfig,
}

impl TransferExecutor {
    pub fn new(
        signer: Arc<KmsSigner>,
        client: Arc<dyn ChainClient>,
        config: TransferExecutorConfig,
    ) -> Self {
        Self {
            signer,
            client,
            config,
        }
    }
}

#[async_trait]
impl TradeExecutor for TransferExecutor {
    async fn execute(
        &self,
        opportunity: &OpportunityWire,
        bridge: &BridgeChoice,
    ) -> anyhow::Result<ExecutionReceipt> {
        let chain = &opportunity.buy_chain;
        let chain_id = *self
            .config
            .chain_ids
            .get(chain)
            .ok_or_else(|| anyhow::anyhow!("no chain id configured for {chain}"))?;
        let deposit = self
            .config
            .deposit_addresses
            .get(&format!("{chain}:{}", bridge.bridge))
            .ok_or_else(|| {
                anyhow::anyhow!("no deposit address for {chain} via {}", bridge.bridge)
            })?;

        let address = self.signer.get_address().await?;
        let nonce = self.client.next_nonce(chain, &address).await?;
        let gas_price = self.client.gas_price(chain).await?;
        let value = BigUint::from((self.config.trade_tokens * 1e18) as u128);

        let tx = LegacyTransaction {
            nonce,
            gas_price: gas_price.clone(),
            gas_limit: self.config.gas_limit,
            to: Some(parse_address(deposit)?),
            value,
            data: Vec::new(),
            chain_id,
        };
        debug!(chain, nonce, bridge = %bridge.bridge, "signing bridge deposit");

        let started = Instant::now();
        let raw = self.signer.sign_transaction(&tx).await?;
        let tx_hash = self.client.send_raw_transaction(chain, &raw).await?;

        let cost_eth = biguint_to_f64(&(gas_price * BigUint::from(self.config.gas_limit))) / 1e18;
        info!(chain, %tx_hash, "bridge deposit submitted");
        Ok(ExecutionReceipt {
            bridge_id: format!("{}-{}", bridge.bridge, tx_hash),
            source_tx_hash: tx_hash,
            latency_secs: started.elapsed().as_secs_f64(),
            cost_eth,
        })
    }
}

fn biguint_to_f64(value: &BigUint) -> f64 {
    value.to_string().parse::<f64>().unwrap_or(0.0)
}
