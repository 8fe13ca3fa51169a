use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info};

use crate::bus::{streams, BusClient, BusError};
use crate::models::{now_ms, CrossChainOpportunity};

/// Guard against division blowups when the previous profit is tiny.
const IMPROVEMENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub dedupe_window_ms: i64,
    /// Minimum relative net-profit improvement required to re-publish a
    /// fingerprint inside the dedupe window (0.1 == 10%).
    pub min_profit_improvement: f64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            dedupe_window_ms: 30_000,
            min_profit_improvement: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    net_profit: f64,
    published_at: i64,
}

/// Publishes opportunities to the bus, deduplicating by fingerprint so the
/// execution side is not flooded with near-identical candidates.
pub struct OpportunityPublisher {
    bus: Arc<dyn BusClient>,
    config: PublisherConfig,
    recent: Mutex<HashMap<String, CacheEntry>>,
    published: Mutex<u64>,
}

impl OpportunityPublisher {
    pub fn new(bus: Arc<dyn BusClient>, config: PublisherConfig) -> Self {
        Self {
            bus,
            config,
            recent: Mutex::new(HashMap::new()),
            published: Mutex::new(0),
        }
    }

    pub fn published_count(&self) -> u64 {
        *self.published.lock()
    }

    /// (token, sourceChain, sourceDex, targetChain, targetDex).
    fn fingerprint(opp: &CrossChainOpportunity) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            opp.token_in, opp.buy_chain, opp.buy_dex, opp.sell_chain, opp.sell_dex
        )
    }

    /// Publish unless an equal-or-better sighting is already inside the
    /// window. Returns whether a message went out.
    pub async fn publish(&self, opp: &CrossChainOpportunity) -> Result<bool, BusError> {
        if !self.should_publish(opp, now_ms()) {
            debug!(pair = %opp.pair, "opportunity deduplicated");
            return Ok(false);
        }

        let wire = json!(opp.wire());
        self.bus.add(streams::OPPORTUNITIES, &wire).await?;
        *self.published.lock() += 1;
        info!(
            pair = %opp.pair,
            buy_chain = %opp.buy_chain,
            sell_chain = %opp.sell_chain,
            net_profit = opp.net_profit,
            "opportunity published"
        );
        Ok(true)
    }

    fn should_publish(&self, opp: &CrossChainOpportunity, now: i64) -> bool {
        let key = Self::fingerprint(opp);
        let mut recent = self.recent.lock();

        // Drop entries that aged out of the window while we are here.
        let window = self.config.dedupe_window_ms;
        recent.retain(|_, entry| now - entry.published_at < window);

        let publish = match recent.get(&key) {
            None => true,
            Some(previous) => {
                let improvement = relative_improvement(previous.net_profit, opp.net_profit);
                improvement >= self.config.min_profit_improvement
            }
        };

        if publish {
            recent.insert(
                key,
                CacheEntry {
                    net_profit: opp.net_profit,
                    published_at: now,
                },
            );
        }
        publish
    }
}

/// Relative improvement of `new` over `previous`. When the previous profit
/// is non-positive the ratio is meaningless, so any increase counts as full
/// improvement and anything else as none.
fn relative_improvement(previous: f64, new: f64) -> f64 {
    if previous <= 0.0 {
        if new > previous {
            1.0
        } else {
            0.0
        }
    } else {
        (new - previous) / previous.max(IMPROVEMENT_EPSILON)
    }
}
