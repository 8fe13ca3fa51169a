//! BridgeBot backend library.
//!
//! Core infrastructure for the cross-chain arbitrage pipeline: bus client,
//! stream consumption, detection engine, bridge subsystem, execution safety
//! layer and the HSM-backed signer. Binaries and integration tests wire
//! these together.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod detector;
pub mod execution;
pub mod lifecycle;
pub mod ml;
pub mod models;
pub mod signer;
pub mod streams;
