use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::models::{WhaleDirection, WhaleSummary, WhaleTransaction};

/// Rolling window of whale flow considered "recent".
const DEFAULT_WINDOW_MS: i64 = 15 * 60 * 1000;

/// A single transaction at or above this notional counts as a super whale.
const SUPER_WHALE_USD: f64 = 1_000_000.0;

/// Net flow within the neutral band reads as no directional signal.
const NEUTRAL_BAND_USD: f64 = 100_000.0;

/// Tracks recent whale transactions per token and summarizes net flow for
/// the confidence model.
pub struct WhaleFlowTracker {
    window_ms: i64,
    by_token: Mutex<HashMap<String, VecDeque<WhaleTransaction>>>,
}

impl WhaleFlowTracker {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            by_token: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_window() -> Self {
        Self::new(DEFAULT_WINDOW_MS)
    }

    pub fn record(&self, tx: WhaleTransaction) {
        let mut map = self.by_token.lock();
        let entries = map.entry(tx.token.to_ascii_uppercase()).or_default();
        entries.push_back(tx);
        // Opportunistic trim keeps queues from growing between summaries.
        if entries.len() > 1000 {
            entries.pop_front();
        }
    }

    /// Summarize flow for `token` over the window ending at `now`.
    pub fn summary_at(&self, token: &str, now: i64) -> Option<WhaleSummary> {
        let mut map = self.by_token.lock();
        let entries = map.get_mut(&token.to_ascii_uppercase())?;
        let cutoff = now - self.window_ms;
        while entries.front().map(|tx| tx.timestamp < cutoff) == Some(true) {
            entries.pop_front();
        }
        if entries.is_empty() {
            return None;
        }

        let mut net_flow = 0.0;
        let mut super_whales = 0u32;
        for tx in entries.iter() {
            match tx.direction {
                WhaleDirection::Buy => net_flow += tx.usd_value,
                WhaleDirection::Sell => net_flow -= tx.usd_value,
            }
            if tx.usd_value >= SUPER_WHALE_USD {
                super_whales += 1;
            }
        }

        let direction = if net_flow > NEUTRAL_BAND_USD {
            "bullish"
        } else if net_flow < -NEUTRAL_BAND_USD {
            "bearish"
        } else {
            "neutral"
        };

        Some(WhaleSummary {
            direction: direction.to_string(),
            net_flow_usd: net_flow,
            super_whale_count: super_whales,
            transaction_count: entries.len() as u32,
        })
    }

    pub fn summary(&self, token: &str) -> Option<WhaleSummary> {
        self.summary_at(token, crate::models::now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(token: &str, direction: WhaleDirection, usd: f64, timestamp: i64) -> WhaleTransaction {
        WhaleTransaction {
            chain: "ethereum".into(),
            token: token.into(),
            direction,
            usd_value: usd,
            amount: usd / 2500.0,
            address: "0xwhale".into(),
            transaction_hash: "0xhash".into(),
            dex: "uniswap".into(),
            impact: 0.0,
            timestamp,
        }
    }

    #[test]
    fn summarizes_net_flow_and_direction() {
        let tracker = WhaleFlowTracker::with_default_window();
        let now = 1_700_000_000_000;
        tracker.record(tx("WETH", WhaleDirection::Buy, 500_000.0, now - 1000));
        tracker.record(tx("WETH", WhaleDirection::Sell, 150_000.0, now - 500));

        let summary = tracker.summary_at("WETH", now).unwrap();
        assert_eq!(summary.direction, "bullish");
        assert!((summary.net_flow_usd - 350_000.0).abs() < 1e-6);
        assert_eq!(summary.super_whale_count, 0);
        assert_eq!(summary.transaction_count, 2);
    }

    #[test]
    fn counts_super_whales() {
        let tracker = WhaleFlowTracker::with_default_window();
        let now = 1_700_000_000_000;
        tracker.record(tx("WETH", WhaleDirection::Buy, 2_500_000.0, now));
        let summary = tracker.summary_at("WETH", now).unwrap();
        assert_eq!(summary.super_whale_count, 1);
    }

    #[test]
    fn window_expires_old_flow() {
        let tracker = WhaleFlowTracker::new(60_000);
        let now = 1_700_000_000_000;
        tracker.record(tx("WETH", WhaleDirection::Buy, 900_000.0, now - 120_000));
        assert!(tracker.summary_at("WETH", now).is_none());
    }

    #[test]
    fn balanced_flow_is_neutral() {
        let tracker = WhaleFlowTracker::with_default_window();
        let now = 1_700_000_000_000;
        tracker.record(tx("WETH", WhaleDirection::Buy, 200_000.0, now));
        tracker.record(tx("WETH", WhaleDirection::Sell, 180_000.0, now));
        assert_eq!(tracker.summary_at("WETH", now).unwrap().direction, "neutral");
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        let tracker = WhaleFlowTracker::with_default_window();
        let now = 1_700_000_000_000;
        tracker.record(tx("weth", WhaleDirection::Buy, 300_000.0, now));
        assert!(tracker.summary_at("WETH", now).is_some());
    }
}
