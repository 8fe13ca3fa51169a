//! Detection engine: price indexing, cross-chain opportunity search,
//! whale/ML confidence composition, deduplicated publishing, and the
//! pre-validation gate in front of the bus.

mod confidence;
mod engine;
mod eth_guard;
mod prevalidation;
mod price_store;
mod publisher;
mod whale;

pub use confidence::{compute_confidence, ConfidenceConfig, ConfidenceInputs, MAX_CONFIDENCE};
pub use engine::{
    BridgeCostEstimator, CrossChainDetector, DetectorConfig, DetectorStats, PredictorBridgeCost,
};
pub use eth_guard::{is_eth_price_pair, EthPriceGuard};
pub use prevalidation::{
    PreValidationConfig, PreValidationMetrics, PreValidationOrchestrator, SimulationCallback,
    SimulationRequest, SimulationResult, ValidationReason, Verdict,
};
pub use price_store::{
    normalize_pair_key, IndexedSnapshot, PriceData, PriceDataManager, PricePoint,
    DEFAULT_MAX_AGE_MS,
};
pub use publisher::{OpportunityPublisher, PublisherConfig};
pub use whale::WhaleFlowTracker;
