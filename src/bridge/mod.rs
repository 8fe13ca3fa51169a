//! Bridge subsystem: latency/cost prediction from route history, the router
//! seam concrete protocol clients plug into, and recovery of interrupted
//! bridge executions.

mod latency;
mod recovery;
mod router;

pub use latency::{
    route_key, BridgeChoice, BridgeLatencyPredictor, BridgeSample, LatencyPrediction, RouteModel,
    Urgency, DEFAULT_SAMPLE_MAX_AGE_MS,
};
pub use recovery::{BridgeRecoveryManager, RecoveryConfig, RecoveryCounters};
pub use router::{BridgeRouter, BridgeRouterFactory, RouterStatus};
