//! Multi-stream consumption with at-least-once semantics.
//!
//! One consumer drives the three detector input streams (prices, whale
//! alerts, pending intents), validates every item, and emits typed events.
//! Invalid items are acked and dropped: poison messages must never wedge a
//! consumer group.

mod consumer;
pub mod validate;

pub use consumer::{ConsumerStats, StreamConsumer, StreamConsumerConfig, StreamEvent};
