use std::collections::{HashMap, VecDeque};

use chrono::{TimeZone, Timelike, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::models::now_ms;

/// Ring capacity per route.
const RING_CAPACITY: usize = 1000;

/// Recency window used for the weighted latency estimate.
const RECENT_WINDOW: usize = 50;

/// Below this many successful samples the conservative table answers.
const MIN_SAMPLES: usize = 10;

/// Samples older than this are purged on cleanup.
pub const DEFAULT_SAMPLE_MAX_AGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

const WEI_PER_ETH: f64 = 1e18;

/// Routes are keyed `"{src}-{dst}-{bridge}"`.
pub fn route_key(src: &str, dst: &str, bridge: &str) -> String {
    format!("{src}-{dst}-{bridge}")
}

/// Built-in worst-case expectations, used until a route has real history.
/// Values are (latency seconds, cost ETH).
fn conservative_estimate(key: &str) -> (f64, f64) {
    match key {
        "ethereum-arbitrum-stargate" => (180.0, 0.001),
        "ethereum-polygon-stargate" => (180.0, 0.001),
        "arbitrum-optimism-stargate" => (90.0, 0.0003),
        "ethereum-arbitrum-across" => (120.0, 0.002),
        // The canonical exit takes the full challenge period.
        "arbitrum-ethereum-native" => (604_800.0, 0.005),
        _ => (300.0, 0.0015),
    }
}

/// Bridges named in the conservative table for a given corridor.
fn table_bridges(src: &str, dst: &str) -> Vec<&'static str> {
    let mut bridges = Vec::new();
    for bridge in ["stargate", "across", "native"] {
        let key = route_key(src, dst, bridge);
        let (latency, cost) = conservative_estimate(&key);
        if (latency, cost) != (300.0, 0.0015) {
            bridges.push(bridge);
        }
    }
    if bridges.is_empty() {
        bridges.push("stargate");
    }
    bridges
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeSample {
    pub latency_secs: f64,
    pub cost_eth: f64,
    pub success: bool,
    pub timestamp: i64,
    pub congestion_level: f64,
    pub gas_price: f64,
}

/// Sufficient statistics maintained per route as samples arrive.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteModel {
    pub mean: f64,
    pub std_dev: f64,
    /// OLS slope of latency against sample index; positive means the route
    /// is getting slower.
    pub trend: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct LatencyPrediction {
    pub latency_secs: f64,
    pub cost_wei: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    fn latency_weight(&self) -> f64 {
        match self {
            Urgency::Low => 0.2,
            Urgency::Medium => 0.4,
            Urgency::High => 0.6,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeChoice {
    pub bridge: String,
    pub score: f64,
    pub prediction: LatencyPrediction,
}

#[derive(Default)]
struct RouteState {
    samples: VecDeque<BridgeSample>,
    model: RouteModel,
}

/// Predicts per-route bridge latency and cost from ring-buffered history.
/// Exclusive owner of its buffers; only derived values leave.
#[derive(Default)]
pub struct BridgeLatencyPredictor {
    routes: Mutex<HashMap<String, RouteState>>,
}

impl BridgeLatencyPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an observed sample and refresh the route model.
    pub fn update_model(&self, src: &str, dst: &str, bridge: &str, sample: BridgeSample) {
        let key = route_key(src, dst, bridge);
        let mut routes = self.routes.lock();
        let state = routes.entry(key).or_default();
        if state.samples.len() == RING_CAPACITY {
            state.samples.pop_front();
        }
        state.samples.push_back(sample);
        state.model = fit_model(&state.samples);
    }

    pub fn model(&self, src: &str, dst: &str, bridge: &str) -> Option<RouteModel> {
        self.routes
            .lock()
            .get(&route_key(src, dst, bridge))
            .map(|state| state.model)
    }

    pub fn sample_count(&self, src: &str, dst: &str, bridge: &str) -> usize {
        self.routes
            .lock()
            .get(&route_key(src, dst, bridge))
            .map(|state| state.samples.len())
            .unwrap_or(0)
    }

    pub fn predict_latency(
        &self,
        src: &str,
        dst: &str,
        bridge: &str,
        amount_tokens: f64,
    ) -> LatencyPrediction {
        self.predict_latency_at(src, dst, bridge, amount_tokens, now_ms())
    }

    /// Deterministic core; `now` drives the congestion step function.
    pub fn predict_latency_at(
        &self,
        src: &str,
        dst: &str,
        bridge: &str,
        amount_tokens: f64,
        now: i64,
    ) -> LatencyPrediction {
        let key = route_key(src, dst, bridge);
        let routes = self.routes.lock();

        let successes: Vec<f64> = routes
            .get(&key)
            .map(|state| {
                state
                    .samples
                    .iter()
                    .filter(|s| s.success)
                    .map(|s| s.latency_secs)
                    .collect()
            })
            .unwrap_or_default();

        if successes.len() < MIN_SAMPLES {
            let (latency_secs, cost_eth) = conservative_estimate(&key);
            return LatencyPrediction {
                latency_secs,
                cost_wei: cost_eth * WEI_PER_ETH,
                confidence: 0.3,
            };
        }

        // Last RECENT_WINDOW successes, oldest first, weighted e^(i/N) so
        // recent samples dominate.
        let window: Vec<f64> = successes
            .iter()
            .rev()
            .take(RECENT_WINDOW)
            .rev()
            .copied()
            .collect();
        let n = window.len();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        for (i, latency) in window.iter().enumerate() {
            let weight = (i as f64 / n as f64).exp();
            weighted_sum += weight * latency;
            weight_total += weight;
        }
        let latency_secs = weighted_sum / weight_total;

        let congestion = congestion_for_hour(hour_utc(now));
        let cost_wei = 0.001 * amount_tokens * (1.0 + congestion * 0.5) * WEI_PER_ETH;

        let mean = window.iter().sum::<f64>() / n as f64;
        let variance = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        let spread_factor = if mean > 0.0 {
            (1.0 - variance / (mean * mean)).max(0.1)
        } else {
            0.1
        };
        let confidence = (n as f64 / RECENT_WINDOW as f64).min(1.0) * spread_factor;

        LatencyPrediction {
            latency_secs,
            cost_wei,
            confidence,
        }
    }

    /// Running accuracy of prefix-mean predictions against actuals over the
    /// ring. O(n) with a single prefix sum.
    pub fn historical_accuracy(&self, src: &str, dst: &str, bridge: &str) -> Option<f64> {
        let routes = self.routes.lock();
        let state = routes.get(&route_key(src, dst, bridge))?;
        if state.samples.len() < 2 {
            return None;
        }

        let mut prefix_sum = 0.0;
        let mut error_sum = 0.0;
        let mut compared = 0usize;
        for (i, sample) in state.samples.iter().enumerate() {
            if i > 0 && sample.latency_secs > 0.0 {
                let predicted = prefix_sum / i as f64;
                error_sum += (predicted - sample.latency_secs).abs() / sample.latency_secs;
                compared += 1;
            }
            prefix_sum += sample.latency_secs;
        }
        if compared == 0 {
            return None;
        }
        Some((1.0 - error_sum / compared as f64).max(0.0))
    }

    /// Score every available bridge for the corridor and return the best.
    pub fn predict_optimal_bridge(
        &self,
        src: &str,
        dst: &str,
        amount_tokens: f64,
        urgency: Urgency,
        _token: &str,
    ) -> Option<BridgeChoice> {
        self.predict_optimal_bridge_at(src, dst, amount_tokens, urgency, now_ms())
    }

    pub fn predict_optimal_bridge_at(
        &self,
        src: &str,
        dst: &str,
        amount_tokens: f64,
        urgency: Urgency,
        now: i64,
    ) -> Option<BridgeChoice> {
        let mut bridges: Vec<String> = table_bridges(src, dst)
            .into_iter()
            .map(str::to_string)
            .collect();
        {
            let routes = self.routes.lock();
            let prefix = format!("{src}-{dst}-");
            for key in routes.keys() {
                if let Some(bridge) = key.strip_prefix(&prefix) {
                    if !bridges.iter().any(|b| b == bridge) {
                        bridges.push(bridge.to_string());
                    }
                }
            }
        }

        let latency_weight = urgency.latency_weight();
        let mut best: Option<BridgeChoice> = None;
        for bridge in bridges {
            let prediction = self.predict_latency_at(src, dst, &bridge, amount_tokens, now);
            let norm_latency = (1.0 - prediction.latency_secs / 3600.0).max(0.0);
            let norm_cost = if amount_tokens > 0.0 {
                (1.0 - prediction.cost_wei / (amount_tokens * WEI_PER_ETH)).max(0.0)
            } else {
                0.0
            };
            let score =
                latency_weight * norm_latency + 0.3 * norm_cost + 0.1 * prediction.confidence;
            let better = best.as_ref().map(|b| score > b.score).unwrap_or(true);
            if better {
                best = Some(BridgeChoice {
                    bridge,
                    score,
                    prediction,
                });
            }
        }
        best
    }

    /// Drop samples older than `max_age_ms`; routes left empty disappear.
    pub fn cleanup(&self, max_age_ms: i64) {
        self.cleanup_at(max_age_ms, now_ms());
    }

    pub fn cleanup_at(&self, max_age_ms: i64, now: i64) {
        let cutoff = now - max_age_ms;
        let mut routes = self.routes.lock();
        let mut dropped_routes = 0usize;
        for state in routes.values_mut() {
            state.samples.retain(|s| s.timestamp > cutoff);
            if !state.samples.is_empty() {
                state.model = fit_model(&state.samples);
            }
        }
        routes.retain(|_, state| {
            let keep = !state.samples.is_empty();
            if !keep {
                dropped_routes += 1;
            }
            keep
        });
        if dropped_routes > 0 {
            debug!(dropped_routes, "bridge history cleanup");
        }
    }
}

fn fit_model(samples: &VecDeque<BridgeSample>) -> RouteModel {
    let n = samples.len();
    if n == 0 {
        return RouteModel::default();
    }
    let nf = n as f64;
    let mean = samples.iter().map(|s| s.latency_secs).sum::<f64>() / nf;
    let variance = samples
        .iter()
        .map(|s| (s.latency_secs - mean).powi(2))
        .sum::<f64>()
        / nf;

    // OLS slope over (index, latency) with a zero-denominator guard.
    let x_mean = (nf - 1.0) / 2.0;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, sample) in samples.iter().enumerate() {
        let dx = i as f64 - x_mean;
        numerator += dx * (sample.latency_secs - mean);
        denominator += dx * dx;
    }
    let trend = if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    };

    RouteModel {
        mean,
        std_dev: variance.sqrt(),
        trend,
    }
}

fn hour_utc(now: i64) -> u32 {
    Utc.timestamp_millis_opt(now)
        .single()
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

/// Time-of-day congestion step: peak 12-18 UTC, daytime shoulders, quiet
/// overnight.
fn congestion_for_hour(hour: u32) -> f64 {
    match hour {
        12..=17 => 0.7,
        6..=11 | 18..=21 => 0.4,
        _ => 0.1,
    }
}
