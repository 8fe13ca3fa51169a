use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::models::{now_ms, PriceUpdate};

/// Version counters never reuse 0, and reset before the float-safe integer
/// ceiling so downstream caches keyed on version stay comparable.
const VERSION_CEILING: u64 = (1 << 53) - 1;

/// Trigger a cleanup pass every N writes.
const CLEANUP_EVERY: u64 = 500;

/// Default retention for a price cell.
pub const DEFAULT_MAX_AGE_MS: i64 = 5 * 60 * 1000;

/// chain -> dex -> pairKey -> latest update.
pub type PriceData = HashMap<String, HashMap<String, HashMap<String, PriceUpdate>>>;

/// One price observation in the by-token index.
#[derive(Debug, Clone)]
pub struct PricePoint {
    pub chain: String,
    pub dex: String,
    pub pair_key: String,
    pub price: f64,
    pub update: PriceUpdate,
}

/// Read-only view built from the store: prices grouped by normalized token
/// pair for O(1) pair lookup during detection.
#[derive(Debug, Clone)]
pub struct IndexedSnapshot {
    pub by_token: HashMap<String, Vec<PricePoint>>,
    pub raw: PriceData,
    pub token_pairs: Vec<String>,
    pub timestamp: i64,
    pub version: u64,
}

/// Map chain-local token symbols onto their canonical cross-chain identity so
/// the same asset matches across chains and DEX naming conventions.
fn canonical_token(symbol: &str) -> String {
    let upper = symbol.to_ascii_uppercase();
    match upper.as_str() {
        "ETH" | "WETH.E" => "WETH".to_string(),
        "BTCB" | "WBTC.E" => "WBTC".to_string(),
        "FUSDT" | "USDT.E" => "USDT".to_string(),
        "USDC.E" => "USDC".to_string(),
        "DAI.E" => "DAI".to_string(),
        _ => upper,
    }
}

/// Normalize a pair key to `"TOKEN0_TOKEN1"`. DEX-prefixed keys like
/// `"UNISWAP_WETH_USDC"` are tolerated: the final two segments win.
pub fn normalize_pair_key(pair_key: &str) -> Option<String> {
    let segments: Vec<&str> = pair_key.split('_').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        return None;
    }
    let token0 = canonical_token(segments[segments.len() - 2]);
    let token1 = canonical_token(segments[segments.len() - 1]);
    Some(format!("{token0}_{token1}"))
}

struct Store {
    data: PriceData,
    writes_since_cleanup: u64,
    version: u64,
}

/// Exclusive owner of the hierarchical price store. Readers only ever get
/// owned snapshots; nothing hands out references into the maps.
pub struct PriceDataManager {
    inner: Mutex<Store>,
    max_age_ms: i64,
}

impl PriceDataManager {
    pub fn new(max_age_ms: i64) -> Self {
        Self {
            inner: Mutex::new(Store {
                data: HashMap::new(),
                writes_since_cleanup: 0,
                version: 1,
            }),
            max_age_ms,
        }
    }

    pub fn with_default_retention() -> Self {
        Self::new(DEFAULT_MAX_AGE_MS)
    }

    /// Overwrite the cell for this update's (chain, dex, pair). Every
    /// `CLEANUP_EVERY` writes a cleanup pass runs inline.
    pub fn handle_price_update(&self, update: PriceUpdate) {
        let mut store = self.inner.lock();
        store
            .data
            .entry(update.chain.clone())
            .or_default()
            .entry(update.dex.clone())
            .or_default()
            .insert(update.pair_key.clone(), update);
        bump_version(&mut store.version);

        store.writes_since_cleanup += 1;
        if store.writes_since_cleanup >= CLEANUP_EVERY {
            store.writes_since_cleanup = 0;
            let max_age = self.max_age_ms;
            Self::cleanup_locked(&mut store, now_ms(), max_age);
        }
    }

    /// Drop cells older than `max_age_ms` and prune empty branches.
    pub fn cleanup(&self) {
        let mut store = self.inner.lock();
        let max_age = self.max_age_ms;
        Self::cleanup_locked(&mut store, now_ms(), max_age);
    }

    fn cleanup_locked(store: &mut Store, now: i64, max_age_ms: i64) {
        let cutoff = now - max_age_ms;
        let mut removed = 0usize;
        for dexes in store.data.values_mut() {
            for pairs in dexes.values_mut() {
                let before = pairs.len();
                pairs.retain(|_, update| update.timestamp >= cutoff);
                removed += before - pairs.len();
            }
            dexes.retain(|_, pairs| !pairs.is_empty());
        }
        store.data.retain(|_, dexes| !dexes.is_empty());
        if removed > 0 {
            bump_version(&mut store.version);
            debug!(removed, "price store cleanup");
        }
    }

    pub fn clear(&self) {
        let mut store = self.inner.lock();
        store.data.clear();
        bump_version(&mut store.version);
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Total live price cells.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .data
            .values()
            .flat_map(|dexes| dexes.values())
            .map(|pairs| pairs.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the by-token index. The snapshot owns all of its data.
    pub fn create_indexed_snapshot(&self) -> IndexedSnapshot {
        let store = self.inner.lock();
        let mut by_token: HashMap<String, Vec<PricePoint>> = HashMap::new();

        for (chain, dexes) in &store.data {
            for (dex, pairs) in dexes {
                for (pair_key, update) in pairs {
                    let Some(normalized) = normalize_pair_key(pair_key) else {
                        continue;
                    };
                    by_token.entry(normalized).or_default().push(PricePoint {
                        chain: chain.clone(),
                        dex: dex.clone(),
                        pair_key: pair_key.clone(),
                        price: update.price,
                        update: update.clone(),
                    });
                }
            }
        }

        let token_pairs: Vec<String> = by_token.keys().cloned().collect();
        IndexedSnapshot {
            by_token,
            raw: store.data.clone(),
            token_pairs,
            timestamp: now_ms(),
            version: store.version,
        }
    }

    #[cfg(test)]
    fn cleanup_at(&self, now: i64) {
        let mut store = self.inner.lock();
        let max_age = self.max_age_ms;
        Self::cleanup_locked(&mut store, now, max_age);
    }

    #[cfg(test)]
    fn set_version(&self, version: u64) {
        self.inner.lock().version = version;
    }
}

fn bump_version(version: &mut u64) {
    if *version >= VERSION_CEILING - 1 {
        *version = 1;
    } else {
        *version += 1;
    }
}
