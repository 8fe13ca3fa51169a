//! Execution safety layer: per-chain circuit breakers with bus-persisted
//! state, native balance monitoring, and the opportunity consumer that wires
//! the safety rails around the concrete trade path.

mod balance_monitor;
mod circuit_breaker;
mod engine;
mod transfer;

pub use balance_monitor::{
    BalanceMonitor, BalanceMonitorConfig, BalanceProvider, BalanceSnapshot, Wallet,
};
pub use circuit_breaker::{BreakerConfig, BreakerState, BreakerView, CircuitBreakerManager};
pub use engine::{
    ExecutionEngine, ExecutionEngineConfig, ExecutionReceipt, ExecutionStats, TradeExecutor,
};
pub use transfer::{ChainClient, TransferExecutor, TransferExecutorConfig};
