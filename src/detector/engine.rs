use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeLatencyPredictor, Urgency};
use crate::lifecycle::{Lifecycle, OperationGuard, ServiceState};
use crate::ml::MlPredictionManager;
use crate::models::{
    now_ms, CrossChainOpportunity, PendingOpportunity, PendingTrigger, PriceUpdate,
};
use crate::streams::StreamEvent;

use super::confidence::{compute_confidence, ConfidenceConfig, ConfidenceInputs};
use super::eth_guard::{is_eth_price_pair, EthPriceGuard};
use super::prevalidation::PreValidationOrchestrator;
use super::price_store::{normalize_pair_key, PriceDataManager, PricePoint};
use super::publisher::OpportunityPublisher;
use super::whale::WhaleFlowTracker;

/// Consecutive failed ticks before the detector backs off.
const DETECTION_ERROR_THRESHOLD: u32 = 5;

/// Back-off window after the error threshold trips.
const DETECTION_CIRCUIT_COOLDOWN_MS: i64 = 30_000;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub detection_interval_ms: u64,
    /// Prices older than this are ignored during a scan.
    pub max_price_age_ms: i64,
    /// Net profit must exceed this fraction of the buy price.
    pub min_profit_threshold: f64,
    /// Per-swap DEX fee fraction.
    pub fee_percentage: f64,
    /// Assumed gas cost per chain touched, in quote units.
    pub gas_usd_per_chain: f64,
    /// Reference trade size, in tokens.
    pub trade_tokens: f64,
    /// Minimum price advantage for a pending-intent opportunity (ratio).
    pub min_pending_diff_ratio: f64,
    /// Intents closer than this to their deadline are not worth chasing.
    pub pending_deadline_margin_ms: i64,
    pub confidence: ConfidenceConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_interval_ms: 100,
            max_price_age_ms: 30_000,
            min_profit_threshold: 0.001,
            fee_percentage: 0.003,
            gas_usd_per_chain: 5.0,
            trade_tokens: 1.0,
            min_pending_diff_ratio: 0.005,
            pending_deadline_margin_ms: 30_000,
            confidence: ConfidenceConfig::default(),
        }
    }
}

/// Bridge cost per token of trade size, in quote units. The execution side
/// refines this; detection only needs a sane screen.
pub trait BridgeCostEstimator: Send + Sync {
    fn estimate(&self, src_chain: &str, dst_chain: &str, trade_tokens: f64) -> f64;
}

/// Default estimator backed by the latency predictor's cost model.
pub struct PredictorBridgeCost {
    latency: Arc<BridgeLatencyPredictor>,
    eth_price_usd: f64,
}

impl PredictorBridgeCost {
    pub fn new(latency: Arc<BridgeLatencyPredictor>, eth_price_usd: f64) -> Self {
        Self {
            latency,
            eth_price_usd,
        }
    }
}

impl BridgeCostEstimator for PredictorBridgeCost {
    fn estimate(&self, src_chain: &str, dst_chain: &str, trade_tokens: f64) -> f64 {
        if trade_tokens <= 0.0 {
            return 0.0;
        }
        let Some(choice) =
            self.latency
                .predict_optimal_bridge(src_chain, dst_chain, trade_tokens, Urgency::Medium, "")
        else {
            return 0.0;
        };
        let cost_eth = choice.prediction.cost_wei / 1e18;
        cost_eth * self.eth_price_usd / trade_tokens
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DetectorStats {
    pub ticks: u64,
    pub failed_ticks: u64,
    pub skipped_by_circuit: u64,
    pub opportunities_found: u64,
    pub published: u64,
    pub rejected_prices: u64,
    pub pending_analyzed: u64,
}

/// Cross-chain arbitrage detector: one guarded tick at a time over the
/// indexed snapshot, candidates enriched, sorted, pre-validated, published.
pub struct CrossChainDetector {
    config: DetectorConfig,
    prices: Arc<PriceDataManager>,
    whales: Arc<WhaleFlowTracker>,
    ml: Arc<MlPredictionManager>,
    bridge_cost: Arc<dyn BridgeCostEstimator>,
    publisher: Arc<OpportunityPublisher>,
    prevalidation: Arc<PreValidationOrchestrator>,
    lifecycle: Lifecycle,
    guard: OperationGuard,
    eth_guard: Mutex<EthPriceGuard>,
    consecutive_errors: Mutex<u32>,
    circuit_until: Mutex<i64>,
    stats: Mutex<DetectorStats>,
}

impl CrossChainDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DetectorConfig,
        prices: Arc<PriceDataManager>,
        whales: Arc<WhaleFlowTracker>,
        ml: Arc<MlPredictionManager>,
        bridge_cost: Arc<dyn BridgeCostEstimator>,
        publisher: Arc<OpportunityPublisher>,
        prevalidation: Arc<PreValidationOrchestrator>,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            config,
            prices,
            whales,
            ml,
            bridge_cost,
            publisher,
            prevalidation,
            lifecycle,
            guard: OperationGuard::new(),
            eth_guard: Mutex::new(EthPriceGuard::new()),
            consecutive_errors: Mutex::new(0),
            circuit_until: Mutex::new(0),
            stats: Mutex::new(DetectorStats::default()),
        }
    }

    pub fn stats(&self) -> DetectorStats {
        *self.stats.lock()
    }

    /// Route one consumer event into the detector's stores.
    pub async fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::Price(update) => self.handle_price(update),
            StreamEvent::Whale(tx) => self.whales.record(tx),
            StreamEvent::Pending(pending) => self.analyze_pending(&pending).await,
            StreamEvent::Error(message) => debug!(%message, "consumer error event"),
        }
    }

    fn handle_price(&self, update: PriceUpdate) {
        if is_eth_price_pair(&update.pair_key)
            && !self.eth_guard.lock().accept(&update.pair_key, update.price)
        {
            warn!(
                pair = %update.pair_key,
                chain = %update.chain,
                price = update.price,
                "price rejected by rate-of-change guard"
            );
            self.stats.lock().rejected_prices += 1;
            return;
        }

        if let Some(pair) = normalize_pair_key(&update.pair_key) {
            self.ml
                .record_price(&update.chain, &pair, update.price, update.timestamp);
        }
        self.prices.handle_price_update(update);
    }

    /// Tick until the lifecycle winds down.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.lifecycle.state() {
                ServiceState::Stopping | ServiceState::Stopped | ServiceState::Error => break,
                ServiceState::Running => self.tick().await,
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(self.config.detection_interval_ms)).await;
        }
        debug!("detector loop ended");
    }

    /// One detection tick. Serialized by the operation guard; skipped while
    /// the local error circuit is cooling down.
    pub async fn tick(&self) {
        if !self.lifecycle.is_running() {
            return;
        }
        let now = now_ms();
        if *self.circuit_until.lock() > now {
            self.stats.lock().skipped_by_circuit += 1;
            return;
        }
        let Some(_permit) = self.guard.try_acquire() else {
            return;
        };
        self.stats.lock().ticks += 1;

        match self.detect_cycle(now).await {
            Ok(published) => {
                *self.consecutive_errors.lock() = 0;
                if published > 0 {
                    debug!(published, "detection tick published opportunities");
                }
            }
            Err(e) => {
                self.stats.lock().failed_ticks += 1;
                let mut errors = self.consecutive_errors.lock();
                *errors += 1;
                warn!(error = %e, consecutive = *errors, "detection tick failed");
                if *errors >= DETECTION_ERROR_THRESHOLD {
                    *self.circuit_until.lock() = now + DETECTION_CIRCUIT_COOLDOWN_MS;
                    *errors = 0;
                    warn!(
                        cooldown_ms = DETECTION_CIRCUIT_COOLDOWN_MS,
                        "detector circuit opened"
                    );
                }
            }
        }
    }

    async fn detect_cycle(&self, now: i64) -> anyhow::Result<usize> {
        let snapshot = self.prices.create_indexed_snapshot();

        let mut candidates = Vec::new();
        for (pair, points) in &snapshot.by_token {
            if let Some(candidate) = self.evaluate_pair(pair, points, now) {
                candidates.push(candidate);
            }
        }
        if candidates.is_empty() {
            return Ok(0);
        }
        self.stats.lock().opportunities_found += candidates.len() as u64;

        // One parallel prediction sweep for every candidate pair, then
        // per-candidate confidence composition.
        let pairs: Vec<(String, String, f64)> = candidates
            .iter()
            .map(|c| (c.buy_chain.clone(), c.pair.clone(), c.buy_price))
            .collect();
        let predictions = self.ml.prefetch_predictions(&pairs).await;

        for candidate in &mut candidates {
            candidate.whale = self.whales.summary_at(&candidate.token_in, now);
            candidate.ml = predictions
                .get(&format!("{}:{}", candidate.buy_chain, candidate.pair))
                .cloned();
            candidate.confidence = compute_confidence(
                &ConfidenceInputs {
                    low_price: candidate.buy_price,
                    high_price: candidate.sell_price,
                    low_timestamp: candidate.created_at,
                    high_timestamp: candidate.created_at,
                    whale: candidate.whale.as_ref(),
                    ml: candidate.ml.as_ref(),
                },
                &self.config.confidence,
                now,
            );
        }

        // Whale-triggered candidates jump the queue; inside each group the
        // fattest net profit goes first.
        candidates.sort_by(|a, b| {
            b.whale
                .is_some()
                .cmp(&a.whale.is_some())
                .then(b.net_profit.partial_cmp(&a.net_profit).unwrap_or(std::cmp::Ordering::Equal))
        });

        let mut published = 0usize;
        for candidate in &candidates {
            let verdict = self.prevalidation.validate_opportunity(candidate).await;
            if !verdict.allowed {
                info!(
                    pair = %candidate.pair,
                    reason = verdict.reason.as_str(),
                    "opportunity blocked by pre-validation"
                );
                continue;
            }
            match self.publisher.publish(candidate).await {
                Ok(true) => published += 1,
                Ok(false) => {}
                // Bus trouble fails the whole tick; the error circuit
                // decides whether to keep trying.
                Err(e) => return Err(e.into()),
            }
        }
        self.stats.lock().published += published as u64;
        Ok(published)
    }

    /// Linear min/max scan with staleness and validity gates, then the cost
    /// model. No sorting, no spread calls.
    fn evaluate_pair(
        &self,
        pair: &str,
        points: &[PricePoint],
        now: i64,
    ) -> Option<CrossChainOpportunity> {
        let cutoff = now - self.config.max_price_age_ms;
        let mut min: Option<&PricePoint> = None;
        let mut max: Option<&PricePoint> = None;
        for point in points {
            if !point.price.is_finite() || point.price <= 0.0 || point.update.timestamp < cutoff {
                continue;
            }
            if min.map(|m| point.price < m.price).unwrap_or(true) {
                min = Some(point);
            }
            if max.map(|m| point.price > m.price).unwrap_or(true) {
                max = Some(point);
            }
        }
        let (min, max) = (min?, max?);
        if min.chain == max.chain || max.price <= min.price {
            return None;
        }

        let price_diff = max.price - min.price;
        let trade_tokens = self.config.trade_tokens;
        let bridge_cost = self
            .bridge_cost
            .estimate(&min.chain, &max.chain, trade_tokens);
        let gas_per_token = if trade_tokens > 0.0 {
            2.0 * self.config.gas_usd_per_chain / trade_tokens
        } else {
            0.0
        };
        let swap_fee_per_token = self.config.fee_percentage * (min.price + max.price);
        let net_profit = price_diff - bridge_cost - gas_per_token - swap_fee_per_token;
        if net_profit <= self.config.min_profit_threshold * min.price {
            return None;
        }

        let (token_in, token_out) = split_pair(pair);
        Some(CrossChainOpportunity {
            pair: pair.to_string(),
            token_in,
            token_out,
            buy_chain: min.chain.clone(),
            buy_dex: min.dex.clone(),
            buy_price: min.price,
            sell_chain: max.chain.clone(),
            sell_dex: max.dex.clone(),
            sell_price: max.price,
            price_diff,
            // Ratio becomes percent exactly once, here.
            percentage_diff: (price_diff / min.price) * 100.0,
            estimated_profit: price_diff * trade_tokens,
            bridge_cost,
            net_profit,
            confidence: 0.0,
            created_at: now,
            trade_size_usd: Some(trade_tokens * min.price),
            whale: None,
            ml: None,
            pending: None,
        })
    }

    /// Mempool-intent path: price the pool after the pending swap lands and
    /// look for a better exit on another chain.
    pub async fn analyze_pending(&self, pending: &PendingOpportunity) {
        let now = now_ms();
        self.stats.lock().pending_analyzed += 1;
        let intent = &pending.intent;

        let deadline_ms = intent.deadline * 1000;
        if deadline_ms - now < self.config.pending_deadline_margin_ms {
            debug!(hash = %intent.hash, "pending intent too close to deadline");
            return;
        }
        let Some(source_chain) = chain_name_for_id(intent.chain_id) else {
            debug!(chain_id = intent.chain_id, "unknown chain id on pending intent");
            return;
        };

        let Some(pair) = normalize_pair_key(&format!("{}_{}", intent.token_in, intent.token_out))
        else {
            return;
        };
        let snapshot = self.prices.create_indexed_snapshot();
        let Some(points) = snapshot.by_token.get(&pair) else {
            return;
        };

        let cutoff = now - self.config.max_price_age_ms;
        // Freshest pool on the intent's chain is the one being swapped into.
        let Some(source) = points
            .iter()
            .filter(|p| p.chain == source_chain && p.update.timestamp >= cutoff)
            .max_by_key(|p| p.update.timestamp)
        else {
            return;
        };

        let amount_tokens = parse_base_units(&intent.amount_in);
        let post_swap_price = post_swap_price(&source.update, &intent.token_in, amount_tokens);
        if !post_swap_price.is_finite() || post_swap_price <= 0.0 {
            return;
        }

        // Best exit on any other chain.
        let mut best: Option<&PricePoint> = None;
        for point in points.iter() {
            if point.chain == source_chain
                || !point.price.is_finite()
                || point.price <= 0.0
                || point.update.timestamp < cutoff
            {
                continue;
            }
            if best.map(|b| point.price > b.price).unwrap_or(true) {
                best = Some(point);
            }
        }
        let Some(target) = best else {
            return;
        };
        let diff_ratio = (target.price - post_swap_price) / post_swap_price;
        if diff_ratio < self.config.min_pending_diff_ratio {
            return;
        }

        let price_diff = target.price - post_swap_price;
        let trade_tokens = self.config.trade_tokens;
        let bridge_cost = self
            .bridge_cost
            .estimate(source_chain, &target.chain, trade_tokens);
        let gas_per_token = if trade_tokens > 0.0 {
            2.0 * self.config.gas_usd_per_chain / trade_tokens
        } else {
            0.0
        };
        let swap_fee_per_token = self.config.fee_percentage * (post_swap_price + target.price);
        let net_profit = price_diff - bridge_cost - gas_per_token - swap_fee_per_token;
        if net_profit <= self.config.min_profit_threshold * post_swap_price {
            return;
        }

        let base_confidence = compute_confidence(
            &ConfidenceInputs {
                low_price: post_swap_price,
                high_price: target.price,
                low_timestamp: source.update.timestamp,
                high_timestamp: target.update.timestamp,
                whale: None,
                ml: None,
            },
            &self.config.confidence,
            now,
        );
        // Sloppy intents are likelier to land off-price; haircut in order.
        let slippage_factor = if intent.slippage_tolerance > 0.03 {
            0.7
        } else if intent.slippage_tolerance > 0.01 {
            0.9
        } else {
            1.0
        };

        let (token_in, token_out) = split_pair(&pair);
        let opportunity = CrossChainOpportunity {
            pair: pair.clone(),
            token_in,
            token_out,
            buy_chain: source_chain.to_string(),
            buy_dex: source.dex.clone(),
            buy_price: post_swap_price,
            sell_chain: target.chain.clone(),
            sell_dex: target.dex.clone(),
            sell_price: target.price,
            price_diff,
            percentage_diff: diff_ratio * 100.0,
            estimated_profit: price_diff * trade_tokens,
            bridge_cost,
            net_profit,
            confidence: base_confidence * slippage_factor,
            created_at: now,
            trade_size_usd: Some(trade_tokens * post_swap_price),
            whale: None,
            ml: None,
            pending: Some(PendingTrigger {
                intent_hash: intent.hash.clone(),
                sender: intent.sender.clone(),
                slippage_tolerance: intent.slippage_tolerance,
            }),
        };

        let verdict = self.prevalidation.validate_opportunity(&opportunity).await;
        if !verdict.allowed {
            debug!(hash = %intent.hash, reason = verdict.reason.as_str(), "pending opportunity blocked");
            return;
        }
        if let Err(e) = self.publisher.publish(&opportunity).await {
            warn!(hash = %intent.hash, error = %e, "pending opportunity publish failed");
        }
    }
}

fn split_pair(pair: &str) -> (String, String) {
    match pair.split_once('_') {
        Some((a, b)) => (a.to_string(), b.to_string()),
        None => (pair.to_string(), String::new()),
    }
}

/// Price of the pool after `amount_in` of `token_in` lands, under constant
/// product. Falls back to the spot price when reserves are unknown.
fn post_swap_price(update: &PriceUpdate, token_in: &str, amount_in: f64) -> f64 {
    let (reserve_in, reserve_out) = if update.token0.eq_ignore_ascii_case(token_in) {
        (update.reserve0, update.reserve1)
    } else {
        (update.reserve1, update.reserve0)
    };
    if reserve_in <= 0.0 || reserve_out <= 0.0 || amount_in <= 0.0 {
        return update.price;
    }
    let amount_out = reserve_out * amount_in / (reserve_in + amount_in);
    (reserve_out - amount_out) / (reserve_in + amount_in)
}

/// Token base units to whole tokens assuming the standard 18 decimals.
fn parse_base_units(amount: &str) -> f64 {
    amount.parse::<f64>().unwrap_or(0.0) / 1e18
}

fn chain_name_for_id(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("ethereum"),
        10 => Some("optimism"),
        56 => Some("bsc"),
        137 => Some("polygon"),
        8453 => Some("base"),
        42161 => Some("arbitrum"),
        43114 => Some("avalanche"),
        _ => None,
    }
}
