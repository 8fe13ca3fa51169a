//! ML prediction plumbing: bounded price histories per pair and a
//! single-flight, TTL'd prediction cache in front of an external model.
//!
//! Predictions are advisory. Every failure mode (no model, thin history,
//! timeout, model error) resolves to `None` and detection carries on.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::models::{now_ms, Prediction};

/// One point of a pair's price history.
#[derive(Debug, Clone, Copy)]
pub struct PriceSample {
    pub price: f64,
    pub timestamp: i64,
}

/// Contract for external models. Implementations live outside the core.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        history: &[PriceSample],
        current_price: f64,
    ) -> anyhow::Result<Prediction>;
}

#[derive(Debug, Clone)]
pub struct MlConfig {
    pub enabled: bool,
    /// FIFO cap per (chain, pair) history.
    pub history_cap: usize,
    /// Minimum history before a prediction is attempted.
    pub min_points: usize,
    pub cache_ttl_ms: i64,
    pub max_latency_ms: u64,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            history_cap: 100,
            min_points: 10,
            cache_ttl_ms: 5_000,
            max_latency_ms: 1_000,
        }
    }
}

enum CacheSlot {
    Ready { prediction: Prediction, at: i64 },
    InFlight(watch::Receiver<Option<Option<Prediction>>>),
}

/// Owns per-pair histories and deduplicates concurrent prediction calls per
/// `chain:pair` key.
pub struct MlPredictionManager {
    config: MlConfig,
    predictor: Option<Arc<dyn Predictor>>,
    histories: Mutex<HashMap<(String, String), VecDeque<PriceSample>>>,
    cache: tokio::sync::Mutex<HashMap<String, CacheSlot>>,
}

impl MlPredictionManager {
    pub fn new(config: MlConfig, predictor: Option<Arc<dyn Predictor>>) -> Self {
        Self {
            config,
            predictor,
            histories: Mutex::new(HashMap::new()),
            cache: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(MlConfig::default(), None)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.predictor.is_some()
    }

    pub fn record_price(&self, chain: &str, pair: &str, price: f64, timestamp: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let mut histories = self.histories.lock();
        let history = histories
            .entry((chain.to_string(), pair.to_string()))
            .or_default();
        if history.len() == self.config.history_cap {
            history.pop_front();
        }
        history.push_back(PriceSample { price, timestamp });
    }

    pub fn history_len(&self, chain: &str, pair: &str) -> usize {
        self.histories
            .lock()
            .get(&(chain.to_string(), pair.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Predict for one pair. Returns None on every failure path.
    pub async fn predict_for(&self, chain: &str, pair: &str, current_price: f64) -> Option<Prediction> {
        if !self.is_enabled() {
            return None;
        }
        let history: Vec<PriceSample> = {
            let histories = self.histories.lock();
            match histories.get(&(chain.to_string(), pair.to_string())) {
                Some(h) if h.len() >= self.config.min_points => h.iter().copied().collect(),
                _ => return None,
            }
        };

        let key = format!("{chain}:{pair}");
        loop {
            let mut cache = self.cache.lock().await;
            match cache.get(&key) {
                Some(CacheSlot::Ready { prediction, at })
                    if now_ms() - at < self.config.cache_ttl_ms =>
                {
                    return Some(prediction.clone());
                }
                Some(CacheSlot::InFlight(rx)) => {
                    let mut rx = rx.clone();
                    drop(cache);
                    if let Some(result) = rx.borrow().clone() {
                        return result;
                    }
                    if rx.changed().await.is_ok() {
                        if let Some(result) = rx.borrow().clone() {
                            return result;
                        }
                    }
                    // Leader vanished without an answer; take over.
                    continue;
                }
                _ => {
                    let (tx, rx) = watch::channel(None);
                    cache.insert(key.clone(), CacheSlot::InFlight(rx));
                    drop(cache);

                    let result = self.run_prediction(&history, current_price).await;

                    let mut cache = self.cache.lock().await;
                    match &result {
                        Some(prediction) => {
                            cache.insert(
                                key.clone(),
                                CacheSlot::Ready {
                                    prediction: prediction.clone(),
                                    at: now_ms(),
                                },
                            );
                        }
                        // Failures are not cached; the next caller retries.
                        None => {
                            cache.remove(&key);
                        }
                    }
                    drop(cache);
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    async fn run_prediction(&self, history: &[PriceSample], current_price: f64) -> Option<Prediction> {
        let predictor = self.predictor.as_ref()?;
        let outcome = tokio::time::timeout(
            Duration::from_millis(self.config.max_latency_ms),
            predictor.predict(history, current_price),
        )
        .await;
        match outcome {
            Ok(Ok(prediction)) => Some(prediction),
            Ok(Err(e)) => {
                warn!(error = %e, "prediction failed");
                None
            }
            Err(_) => {
                debug!("prediction timed out");
                None
            }
        }
    }

    /// Fan out predictions for many pairs. Keyed by `chain:pair`; pairs that
    /// fail or lack history are simply absent. Disabled manager: empty map.
    pub async fn prefetch_predictions(
        self: &Arc<Self>,
        pairs: &[(String, String, f64)],
    ) -> HashMap<String, Prediction> {
        let mut results = HashMap::new();
        if !self.is_enabled() {
            return results;
        }

        let mut tasks = tokio::task::JoinSet::new();
        for (chain, pair, price) in pairs.iter().cloned() {
            let manager = Arc::clone(self);
            tasks.spawn(async move {
                let prediction = manager.predict_for(&chain, &pair, price).await;
                (format!("{chain}:{pair}"), prediction)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Ok((key, Some(prediction))) = joined {
                results.insert(key, prediction);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingPredictor {
        calls: AtomicU32,
        delay_ms: u64,
        fail: bool,
    }

    #[async_trait]
    impl Predictor for CountingPredictor {
        async fn predict(
            &self,
            _history: &[PriceSample],
            current_price: f64,
        ) -> anyhow::Result<Prediction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail {
                anyhow::bail!("model offline");
            }
            Ok(Prediction {
                direction: "up".into(),
                confidence: 0.7,
                predicted_price: Some(current_price * 1.01),
            })
        }
    }

    fn manager_with(predictor: Arc<CountingPredictor>) -> Arc<MlPredictionManager> {
        let config = MlConfig {
            enabled: true,
            max_latency_ms: 100,
            ..MlConfig::default()
        };
        let manager = Arc::new(MlPredictionManager::new(config, Some(predictor)));
        for i in 0..20 {
            manager.record_price("ethereum", "WETH_USDC", 2500.0 + i as f64, 1_700_000_000_000 + i);
        }
        manager
    }

    #[tokio::test]
    async fn thin_history_returns_none() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail: false,
        });
        let config = MlConfig {
            enabled: true,
            ..MlConfig::default()
        };
        let manager = MlPredictionManager::new(config, Some(predictor.clone()));
        for i in 0..5 {
            manager.record_price("ethereum", "WETH_USDC", 2500.0, 1_700_000_000_000 + i);
        }
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_none());
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let manager = MlPredictionManager::disabled();
        for i in 0..250 {
            manager.record_price("ethereum", "WETH_USDC", 2500.0, i);
        }
        assert_eq!(manager.history_len("ethereum", "WETH_USDC"), 100);
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_prediction() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 20,
            fail: false,
        });
        let manager = manager_with(predictor.clone());

        let a = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.predict_for("ethereum", "WETH_USDC", 2500.0).await })
        };
        let b = {
            let m = Arc::clone(&manager);
            tokio::spawn(async move { m.predict_for("ethereum", "WETH_USDC", 2500.0).await })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_some() && b.is_some());
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail: false,
        });
        let manager = manager_with(predictor.clone());
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_some());
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_some());
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_fails_open_and_is_not_cached() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 500,
            fail: false,
        });
        let manager = manager_with(predictor.clone());
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_none());
        // Not cached: a second call tries the model again.
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_none());
        assert_eq!(predictor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn model_error_fails_open() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail: true,
        });
        let manager = manager_with(predictor);
        assert!(manager.predict_for("ethereum", "WETH_USDC", 2500.0).await.is_none());
    }

    #[tokio::test]
    async fn disabled_prefetch_is_empty() {
        let manager = Arc::new(MlPredictionManager::disabled());
        let pairs = vec![("ethereum".to_string(), "WETH_USDC".to_string(), 2500.0)];
        assert!(manager.prefetch_predictions(&pairs).await.is_empty());
    }

    #[tokio::test]
    async fn prefetch_returns_keyed_map() {
        let predictor = Arc::new(CountingPredictor {
            calls: AtomicU32::new(0),
            delay_ms: 0,
            fail: false,
        });
        let manager = manager_with(predictor);
        for i in 0..20 {
            manager.record_price("arbitrum", "WETH_USDC", 2510.0 + i as f64, 1_700_000_000_000 + i);
        }

        let pairs = vec![
            ("ethereum".to_string(), "WETH_USDC".to_string(), 2500.0),
            ("arbitrum".to_string(), "WETH_USDC".to_string(), 2510.0),
            ("optimism".to_string(), "WETH_USDC".to_string(), 2505.0),
        ];
        let map = manager.prefetch_predictions(&pairs).await;
        assert!(map.contains_key("ethereum:WETH_USDC"));
        assert!(map.contains_key("arbitrum:WETH_USDC"));
        // No history on optimism: absent, not an error.
        assert!(!map.contains_key("optimism:WETH_USDC"));
    }
}
