use async_trait::async_trait;
use serde_json::Value;

/// One delivered stream entry. `data` is the decoded `data` field: either a
/// single message object or a batch envelope (see [`super::unwrap_batch`]).
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub stream: String,
    pub id: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Blocking read elapsed with no data. Normal; callers swallow it.
    #[error("bus read timed out")]
    Timeout,
    #[error("bus i/o error: {0}")]
    Io(String),
    #[error("malformed bus payload: {0}")]
    Payload(String),
}

impl BusError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::Timeout)
    }
}

/// Bus operations the core depends on. At-least-once delivery: entries stay
/// pending until acked, and acks are per stream entry (never per batch item).
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Idempotent: an already-existing group is success.
    async fn create_consumer_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    /// Read new entries (`>`) for `consumer` across `streams`. An empty vec
    /// means the block window elapsed quietly.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[&str],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEntry>, BusError>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError>;

    /// Append a message; returns the assigned entry id.
    async fn add(&self, stream: &str, data: &Value) -> Result<String, BusError>;

    /// Tail-read up to `count` most recent entries, newest first. Used for
    /// circuit breaker restoration; no consumer group involved.
    async fn read_recent(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, BusError>;

    /// Cursor-paged key scan (SCAN, never KEYS). `pattern` uses glob syntax.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, BusError>;

    async fn get_value(&self, key: &str) -> Result<Option<Value>, BusError>;

    async fn set_value(
        &self,
        key: &str,
        value: &Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), BusError>;

    async fn delete(&self, key: &str) -> Result<(), BusError>;
}
