use crate::models::{Prediction, WhaleSummary};

/// Multipliers applied on top of the base price-gap confidence.
#[derive(Debug, Clone)]
pub struct ConfidenceConfig {
    pub bullish_boost: f64,
    pub bearish_penalty: f64,
    pub super_whale_boost: f64,
    pub flow_boost: f64,
    pub significant_flow_threshold: f64,
    pub ml_min_confidence: f64,
    pub ml_aligned_boost: f64,
    pub ml_opposed_penalty: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            bullish_boost: 1.15,
            bearish_penalty: 0.85,
            super_whale_boost: 1.25,
            flow_boost: 1.1,
            significant_flow_threshold: 1_000_000.0,
            ml_min_confidence: 0.3,
            ml_aligned_boost: 1.2,
            ml_opposed_penalty: 0.8,
        }
    }
}

/// Inputs for one confidence computation. Timestamps are epoch ms of the two
/// price observations backing the opportunity.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs<'a> {
    pub low_price: f64,
    pub high_price: f64,
    pub low_timestamp: i64,
    pub high_timestamp: i64,
    pub whale: Option<&'a WhaleSummary>,
    pub ml: Option<&'a Prediction>,
}

/// Cap on the final confidence; nothing is ever a sure thing.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// Compose confidence from price gap, data freshness, whale flow and ML
/// signals. Pure: same inputs, same output.
pub fn compute_confidence(inputs: &ConfidenceInputs, cfg: &ConfidenceConfig, now: i64) -> f64 {
    let base = base_confidence(inputs.low_price, inputs.high_price);
    if base == 0.0 {
        return 0.0;
    }

    let oldest = inputs.low_timestamp.min(inputs.high_timestamp);
    let age_minutes = (now - oldest).max(0) as f64 / 60_000.0;
    let freshness = (1.0 - age_minutes * 0.1).max(0.1);

    let mut whale_boost = 1.0;
    if let Some(whale) = inputs.whale {
        whale_boost *= match whale.direction.as_str() {
            "bullish" => cfg.bullish_boost,
            "bearish" => cfg.bearish_penalty,
            _ => 1.0,
        };
        if whale.super_whale_count > 0 {
            whale_boost *= cfg.super_whale_boost;
        }
        if whale.net_flow_usd.abs() > cfg.significant_flow_threshold {
            whale_boost *= cfg.flow_boost;
        }
    }

    let mut ml_boost = 1.0;
    if let Some(ml) = inputs.ml {
        if ml.confidence.abs() >= cfg.ml_min_confidence {
            // The arbitrage thesis is that the spread closes upward on the
            // buy side, so an "up" prediction is aligned and "down" opposes.
            ml_boost = match ml.direction.as_str() {
                "up" => cfg.ml_aligned_boost,
                "down" => cfg.ml_opposed_penalty,
                _ => 1.0,
            };
        }
    }

    (base * freshness * whale_boost * ml_boost).min(MAX_CONFIDENCE)
}

/// Price-gap base: the relative spread, capped at 50% and scaled onto [0, 1].
/// Invalid prices contribute zero so garbage never scores.
fn base_confidence(low: f64, high: f64) -> f64 {
    if !low.is_finite() || !high.is_finite() || low <= 0.0 || high <= 0.0 || high < low {
        return 0.0;
    }
    (high / low - 1.0).min(0.5) * 2.0
}
