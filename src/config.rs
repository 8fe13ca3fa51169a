use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use uuid::Uuid;

use crate::bridge::RecoveryConfig;
use crate::detector::{ConfidenceConfig, DetectorConfig, PreValidationConfig, PublisherConfig};
use crate::execution::{BalanceMonitorConfig, BreakerConfig};
use crate::streams::StreamConsumerConfig;

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
    /// Explicit instance id; generated from the name + a uuid when empty.
    pub instance_id: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "detector".to_string(),
            instance_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSection {
    pub group: String,
    pub poll_interval_ms: u64,
    pub price_batch: usize,
    pub whale_batch: usize,
    pub pending_batch: usize,
    pub block_timeout_ms: u64,
    pub min_valid_price: f64,
    pub max_valid_price: f64,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        let defaults = StreamConsumerConfig::default();
        Self {
            group: defaults.group,
            poll_interval_ms: defaults.poll_interval_ms,
            price_batch: defaults.price_batch,
            whale_batch: defaults.whale_batch,
            pending_batch: defaults.pending_batch,
            block_timeout_ms: defaults.block_timeout_ms,
            min_valid_price: defaults.min_valid_price,
            max_valid_price: defaults.max_valid_price,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectorSection {
    pub detection_interval_ms: u64,
    pub max_price_age_ms: i64,
    pub min_profit_threshold: f64,
    pub fee_percentage: f64,
    pub gas_usd_per_chain: f64,
    pub trade_tokens: f64,
    pub eth_price_usd: f64,
    pub min_pending_diff_ratio: f64,
    pub pending_deadline_margin_ms: i64,
}

impl Default for DetectorSection {
    fn default() -> Self {
        let defaults = DetectorConfig::default();
        Self {
            detection_interval_ms: defaults.detection_interval_ms,
            max_price_age_ms: defaults.max_price_age_ms,
            min_profit_threshold: defaults.min_profit_threshold,
            fee_percentage: defaults.fee_percentage,
            gas_usd_per_chain: defaults.gas_usd_per_chain,
            trade_tokens: defaults.trade_tokens,
            eth_price_usd: 2500.0,
            min_pending_diff_ratio: defaults.min_pending_diff_ratio,
            pending_deadline_margin_ms: defaults.pending_deadline_margin_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub dedupe_window_ms: i64,
    pub min_profit_improvement: f64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        let defaults = PublisherConfig::default();
        Self {
            dedupe_window_ms: defaults.dedupe_window_ms,
            min_profit_improvement: defaults.min_profit_improvement,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreValidationSection {
    pub enabled: bool,
    pub monthly_budget: u32,
    pub min_profit_for_validation: f64,
    pub sample_rate: f64,
    pub max_latency_ms: u64,
    pub default_trade_size_usd: f64,
}

impl Default for PreValidationSection {
    fn default() -> Self {
        let defaults = PreValidationConfig::default();
        Self {
            enabled: defaults.enabled,
            monthly_budget: defaults.monthly_budget,
            min_profit_for_validation: defaults.min_profit_for_validation,
            sample_rate: defaults.sample_rate,
            max_latency_ms: defaults.max_latency_ms,
            default_trade_size_usd: defaults.default_trade_size_usd,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub check_interval_ms: u64,
    pub max_age_ms: i64,
    pub max_concurrent_recoveries: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        let defaults = RecoveryConfig::default();
        Self {
            check_interval_ms: defaults.check_interval_ms,
            max_age_ms: defaults.max_age_ms,
            max_concurrent_recoveries: defaults.max_concurrent_recoveries,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_period_ms: i64,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            cooldown_period_ms: defaults.cooldown_period_ms,
            half_open_max_attempts: defaults.half_open_max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanceSection {
    pub enabled: bool,
    pub check_interval_ms: u64,
    pub low_balance_threshold_eth: f64,
}

impl Default for BalanceSection {
    fn default() -> Self {
        let defaults = BalanceMonitorConfig::default();
        Self {
            enabled: defaults.enabled,
            check_interval_ms: defaults.check_interval_ms,
            low_balance_threshold_eth: defaults.low_balance_threshold_eth,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecuritySection {
    /// HMAC envelopes for persisted state. Key comes from HMAC_SIGNING_KEY.
    pub hmac_signing: bool,
    /// HSM-backed transaction signing. Keys come from KMS_KEY_ID*.
    pub kms_signing: bool,
}

/// Full application configuration: TOML file plus environment overrides.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSection,
    pub redis: RedisSection,
    pub consumer: ConsumerSection,
    pub detector: DetectorSection,
    pub publisher: PublisherSection,
    pub prevalidation: PreValidationSection,
    pub recovery: RecoverySection,
    pub breakers: BreakerSection,
    pub balances: BalanceSection,
    pub security: SecuritySection,
    #[serde(skip)]
    hmac_key: Option<Vec<u8>>,
}

impl AppConfig {
    /// Load from an optional TOML file, then layer environment overrides and
    /// validate. A missing explicit config path is a hard error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("cannot parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            if !url.trim().is_empty() {
                self.redis.url = url;
            }
        }
        if let Ok(id) = std::env::var("INSTANCE_ID") {
            if !id.trim().is_empty() {
                self.service.instance_id = id;
            }
        }
        self.security.hmac_signing = env_flag("FEATURE_HMAC_SIGNING", self.security.hmac_signing);
        self.security.kms_signing = env_flag("FEATURE_KMS_SIGNING", self.security.kms_signing);
        self.hmac_key = std::env::var("HMAC_SIGNING_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(String::into_bytes);

        if self.service.instance_id.trim().is_empty() {
            let suffix = Uuid::new_v4().to_string();
            self.service.instance_id =
                format!("{}-{}", self.service.name, &suffix[..8.min(suffix.len())]);
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.redis.url.trim().is_empty(), "redis.url must be set");
        anyhow::ensure!(
            self.consumer.min_valid_price < self.consumer.max_valid_price,
            "consumer price bounds are inverted"
        );
        anyhow::ensure!(
            self.consumer.poll_interval_ms > 0 && self.detector.detection_interval_ms > 0,
            "intervals must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.prevalidation.sample_rate),
            "prevalidation.sample_rate must be within [0, 1]"
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.detector.fee_percentage),
            "detector.fee_percentage must be a fraction"
        );
        anyhow::ensure!(
            self.detector.trade_tokens >= 0.0,
            "detector.trade_tokens cannot be negative"
        );
        anyhow::ensure!(
            self.recovery.max_concurrent_recoveries > 0,
            "recovery.max_concurrent_recoveries must be positive"
        );
        if self.security.hmac_signing {
            anyhow::ensure!(
                self.hmac_key.is_some(),
                "FEATURE_HMAC_SIGNING is on but HMAC_SIGNING_KEY is not set"
            );
        }
        Ok(())
    }

    /// HMAC key for persisted envelopes, when signing is enabled.
    pub fn hmac_key(&self) -> Option<Vec<u8>> {
        if self.security.hmac_signing {
            self.hmac_key.clone()
        } else {
            None
        }
    }

    pub fn consumer_config(&self) -> StreamConsumerConfig {
        StreamConsumerConfig {
            instance_id: self.service.instance_id.clone(),
            group: self.consumer.group.clone(),
            poll_interval_ms: self.consumer.poll_interval_ms,
            price_batch: self.consumer.price_batch,
            whale_batch: self.consumer.whale_batch,
            pending_batch: self.consumer.pending_batch,
            block_timeout_ms: self.consumer.block_timeout_ms,
            min_valid_price: self.consumer.min_valid_price,
            max_valid_price: self.consumer.max_valid_price,
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            detection_interval_ms: self.detector.detection_interval_ms,
            max_price_age_ms: self.detector.max_price_age_ms,
            min_profit_threshold: self.detector.min_profit_threshold,
            fee_percentage: self.detector.fee_percentage,
            gas_usd_per_chain: self.detector.gas_usd_per_chain,
            trade_tokens: self.detector.trade_tokens,
            min_pending_diff_ratio: self.detector.min_pending_diff_ratio,
            pending_deadline_margin_ms: self.detector.pending_deadline_margin_ms,
            confidence: ConfidenceConfig::default(),
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            dedupe_window_ms: self.publisher.dedupe_window_ms,
            min_profit_improvement: self.publisher.min_profit_improvement,
        }
    }

    pub fn prevalidation_config(&self) -> PreValidationConfig {
        PreValidationConfig {
            enabled: self.prevalidation.enabled,
            monthly_budget: self.prevalidation.monthly_budget,
            min_profit_for_validation: self.prevalidation.min_profit_for_validation,
            sample_rate: self.prevalidation.sample_rate,
            max_latency_ms: self.prevalidation.max_latency_ms,
            default_trade_size_usd: self.prevalidation.default_trade_size_usd,
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            check_interval_ms: self.recovery.check_interval_ms,
            max_age_ms: self.recovery.max_age_ms,
            max_concurrent_recoveries: self.recovery.max_concurrent_recoveries,
            hmac_key: self.hmac_key(),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breakers.failure_threshold,
            cooldown_period_ms: self.breakers.cooldown_period_ms,
            half_open_max_attempts: self.breakers.half_open_max_attempts,
        }
    }

    pub fn balance_config(&self) -> BalanceMonitorConfig {
        BalanceMonitorConfig {
            enabled: self.balances.enabled,
            check_interval_ms: self.balances.check_interval_ms,
            low_balance_threshold_eth: self.balances.low_balance_threshold_eth,
        }
    }
}
