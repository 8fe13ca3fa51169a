use std::collections::{HashMap, VecDeque};

/// Maximum deviation from the rolling median before a price is rejected.
const MAX_MEDIAN_DEVIATION: f64 = 0.2;

/// Accepted-price history kept per pair.
const HISTORY_CAP: usize = 10;

/// Samples required before the deviation check engages. Below this the guard
/// accepts unconditionally, which admits an early outlier; the median check
/// catches it as soon as the window fills.
const MIN_SAMPLES: usize = 3;

/// Is this a majors pair the guard should police? Recognizes an ETH leg
/// (WETH, leading ETH_, or an embedded _ETH_) against a major stablecoin.
pub fn is_eth_price_pair(pair_key: &str) -> bool {
    let upper = pair_key.to_ascii_uppercase();
    let eth_leg =
        upper.contains("WETH") || upper.starts_with("ETH_") || upper.contains("_ETH_");
    if !eth_leg {
        return false;
    }
    ["USDC", "USDT", "DAI", "BUSD"]
        .iter()
        .any(|stable| upper.contains(stable))
}

/// Rate-of-change circuit breaker for ETH/stable pairs: a feed glitch that
/// prints 200 where 3000 belongs must not enter the price store.
#[derive(Default)]
pub struct EthPriceGuard {
    history: HashMap<String, VecDeque<f64>>,
}

impl EthPriceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept or reject `price` for `pair_key`. Accepted prices enter the
    /// history; rejected prices leave it untouched.
    pub fn accept(&mut self, pair_key: &str, price: f64) -> bool {
        if !price.is_finite() || price <= 0.0 {
            return false;
        }

        let history = self.history.entry(pair_key.to_string()).or_default();
        if history.len() >= MIN_SAMPLES {
            let median = median_of(history);
            let deviation = (price - median).abs() / median;
            if deviation > MAX_MEDIAN_DEVIATION {
                return false;
            }
        }

        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(price);
        true
    }

    #[cfg(test)]
    fn history_len(&self, pair_key: &str) -> usize {
        self.history.get(pair_key).map(VecDeque::len).unwrap_or(0)
    }
}

fn median_of(values: &VecDeque<f64>) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("history holds only finite prices"));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
