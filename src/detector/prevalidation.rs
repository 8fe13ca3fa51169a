use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{now_ms, CrossChainOpportunity};

/// Request handed to the simulation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub chain: String,
    pub token_pair: String,
    pub dex: String,
    pub trade_size_usd: f64,
    pub expected_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub success: bool,
    pub would_revert: bool,
}

pub type SimulationFuture = Pin<Box<dyn Future<Output = anyhow::Result<SimulationResult>> + Send>>;
pub type SimulationCallback = Arc<dyn Fn(SimulationRequest) -> SimulationFuture + Send + Sync>;

/// Why validation reached its verdict. A structured reason, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationReason {
    NotEnabled,
    NotSampled,
    ValidatedPass,
    ValidatedFail,
}

impl ValidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationReason::NotEnabled => "not_enabled",
            ValidationReason::NotSampled => "not_sampled",
            ValidationReason::ValidatedPass => "validated_pass",
            ValidationReason::ValidatedFail => "validated_fail",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: ValidationReason,
}

#[derive(Debug, Clone)]
pub struct PreValidationConfig {
    pub enabled: bool,
    /// Simulations allowed per calendar month.
    pub monthly_budget: u32,
    /// Opportunities below this net profit are never worth a simulation.
    pub min_profit_for_validation: f64,
    /// Fraction of eligible opportunities actually simulated.
    pub sample_rate: f64,
    pub max_latency_ms: u64,
    pub default_trade_size_usd: f64,
}

impl Default for PreValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            monthly_budget: 1000,
            min_profit_for_validation: 10.0,
            sample_rate: 0.1,
            max_latency_ms: 2000,
            default_trade_size_usd: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreValidationMetrics {
    pub budget_used: u32,
    pub budget_remaining: u32,
    pub success_count: u64,
    pub fail_count: u64,
    pub success_rate: f64,
}

struct State {
    budget_used: u32,
    budget_reset_time: i64,
    success_count: u64,
    fail_count: u64,
}

/// Gates publishing behind an optional on-chain simulation. The gate fails
/// open everywhere: a broken or slow simulator must never block the
/// pipeline, only a definitive "this would revert" does.
pub struct PreValidationOrchestrator {
    config: PreValidationConfig,
    state: Mutex<State>,
    callback: Mutex<Option<SimulationCallback>>,
}

impl PreValidationOrchestrator {
    pub fn new(config: PreValidationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                budget_used: 0,
                budget_reset_time: now_ms(),
                success_count: 0,
                fail_count: 0,
            }),
            callback: Mutex::new(None),
        }
    }

    pub fn set_simulation_callback(&self, callback: SimulationCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub fn metrics(&self) -> PreValidationMetrics {
        let state = self.state.lock();
        let attempts = state.success_count + state.fail_count;
        PreValidationMetrics {
            budget_used: state.budget_used,
            budget_remaining: self.config.monthly_budget.saturating_sub(state.budget_used),
            success_count: state.success_count,
            fail_count: state.fail_count,
            success_rate: if attempts == 0 {
                0.0
            } else {
                state.success_count as f64 / attempts as f64
            },
        }
    }

    pub async fn validate_opportunity(&self, opp: &CrossChainOpportunity) -> Verdict {
        self.validate_at(opp, now_ms(), rand::random::<f64>()).await
    }

    /// Deterministic core: `now` and the sampling draw are injected.
    pub async fn validate_at(
        &self,
        opp: &CrossChainOpportunity,
        now: i64,
        sample: f64,
    ) -> Verdict {
        if !self.config.enabled {
            return Verdict {
                allowed: true,
                reason: ValidationReason::NotEnabled,
            };
        }

        let callback = {
            let mut state = self.state.lock();
            if state.budget_reset_time < start_of_month(now) {
                debug!(previous_used = state.budget_used, "pre-validation budget reset");
                state.budget_used = 0;
                state.budget_reset_time = now;
            }

            let sampled = state.budget_used < self.config.monthly_budget
                && opp.net_profit >= self.config.min_profit_for_validation
                && sample < self.config.sample_rate;
            if !sampled {
                return Verdict {
                    allowed: true,
                    reason: ValidationReason::NotSampled,
                };
            }

            let Some(callback) = self.callback.lock().clone() else {
                // Nothing to simulate against; let it through.
                return Verdict {
                    allowed: true,
                    reason: ValidationReason::ValidatedPass,
                };
            };

            // Count the budget now so only actual simulations consume it.
            state.budget_used += 1;
            callback
        };

        let request = SimulationRequest {
            chain: opp.buy_chain.clone(),
            token_pair: opp.pair.clone(),
            dex: opp.buy_dex.clone(),
            trade_size_usd: opp.trade_size_usd.unwrap_or(self.config.default_trade_size_usd),
            expected_price: opp.buy_price,
        };

        let outcome = tokio::time::timeout(
            Duration::from_millis(self.config.max_latency_ms),
            callback(request),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => {
                let mut state = self.state.lock();
                if result.success && !result.would_revert {
                    state.success_count += 1;
                    Verdict {
                        allowed: true,
                        reason: ValidationReason::ValidatedPass,
                    }
                } else {
                    state.fail_count += 1;
                    Verdict {
                        allowed: false,
                        reason: ValidationReason::ValidatedFail,
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "simulation failed; allowing opportunity");
                Verdict {
                    allowed: true,
                    reason: ValidationReason::ValidatedPass,
                }
            }
            Err(_) => {
                warn!("simulation timed out; allowing opportunity");
                Verdict {
                    allowed: true,
                    reason: ValidationReason::ValidatedPass,
                }
            }
        }
    }
}

/// Epoch ms of the first instant of the month containing `now`.
fn start_of_month(now: i64) -> i64 {
    let dt = match Utc.timestamp_millis_opt(now).single() {
        Some(dt) => dt,
        None => return 0,
    };
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|som| som.timestamp_millis())
        .unwrap_or(0)
}
