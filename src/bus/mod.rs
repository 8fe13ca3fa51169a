//! Message bus client: append-only streams with consumer groups, explicit
//! acks, key scans and TTL'd key/value records.
//!
//! Everything cross-process in this system rides the bus. Components talk to
//! the `BusClient` trait; production uses `RedisBus`, tests use `InMemoryBus`.

mod client;
mod envelope;
mod memory;
mod redis_bus;

pub use client::{BusClient, BusError, StreamEntry};
pub use envelope::{
    open_signed, sign_envelope, unwrap_batch, wrap_batch, EnvelopeError, SignedEnvelope,
};
pub use memory::InMemoryBus;
pub use redis_bus::RedisBus;

/// Stream names shared by all services.
pub mod streams {
    pub const PRICE_UPDATES: &str = "stream:price-updates";
    pub const WHALE_ALERTS: &str = "stream:whale-alerts";
    pub const PENDING_OPPORTUNITIES: &str = "stream:pending-opportunities";
    pub const OPPORTUNITIES: &str = "stream:opportunities";
    pub const CIRCUIT_BREAKER: &str = "stream:circuit-breaker";
}

/// Key prefix for persisted bridge recovery checkpoints.
pub const BRIDGE_RECOVERY_PREFIX: &str = "bridge:recovery:";
