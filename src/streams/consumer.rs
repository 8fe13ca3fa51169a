use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::{streams, unwrap_batch, BusClient, BusError, StreamEntry};
use crate::lifecycle::{Lifecycle, OperationGuard, ServiceState};
use crate::models::{now_ms, PendingOpportunity, PipelineTimestamps, PriceUpdate, WhaleTransaction};

use super::validate::{validate_pending, validate_price, validate_whale};

/// Typed event emitted for every accepted stream item.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Price(PriceUpdate),
    Whale(WhaleTransaction),
    Pending(PendingOpportunity),
    /// Non-timeout bus failure; the poll loop keeps going.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct StreamConsumerConfig {
    pub instance_id: String,
    pub group: String,
    pub poll_interval_ms: u64,
    pub price_batch: usize,
    pub whale_batch: usize,
    pub pending_batch: usize,
    pub block_timeout_ms: u64,
    pub min_valid_price: f64,
    pub max_valid_price: f64,
}

impl Default for StreamConsumerConfig {
    fn default() -> Self {
        Self {
            instance_id: "detector-local".to_string(),
            group: "detector".to_string(),
            poll_interval_ms: 100,
            price_batch: 50,
            whale_batch: 10,
            pending_batch: 20,
            block_timeout_ms: 1000,
            min_valid_price: 1e-12,
            max_valid_price: 1e12,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerStats {
    pub cycles: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub bus_errors: u64,
}

#[derive(Clone, Copy)]
enum StreamKind {
    Price,
    Whale,
    Pending,
}

/// Drives the three input streams in parallel within a cycle; cycles never
/// overlap, and the next one is scheduled only after the previous finishes.
pub struct StreamConsumer {
    bus: Arc<dyn BusClient>,
    config: StreamConsumerConfig,
    lifecycle: Lifecycle,
    guard: OperationGuard,
    events: mpsc::Sender<StreamEvent>,
    stats: Mutex<ConsumerStats>,
}

impl StreamConsumer {
    pub fn new(
        bus: Arc<dyn BusClient>,
        config: StreamConsumerConfig,
        lifecycle: Lifecycle,
        events: mpsc::Sender<StreamEvent>,
    ) -> Self {
        Self {
            bus,
            config,
            lifecycle,
            guard: OperationGuard::new(),
            events,
            stats: Mutex::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        *self.stats.lock()
    }

    /// Create the consumer groups. Safe to call repeatedly.
    pub async fn init(&self) -> Result<(), BusError> {
        for stream in [
            streams::PRICE_UPDATES,
            streams::WHALE_ALERTS,
            streams::PENDING_OPPORTUNITIES,
        ] {
            self.bus.create_consumer_group(stream, &self.config.group).await?;
        }
        Ok(())
    }

    /// Poll until the lifecycle leaves RUNNING for good.
    pub async fn run(&self) {
        loop {
            match self.lifecycle.state() {
                ServiceState::Stopping | ServiceState::Stopped | ServiceState::Error => break,
                ServiceState::Running => {
                    self.poll_cycle().await;
                }
                // Not up yet; check back shortly.
                _ => {}
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
        debug!(instance = %self.config.instance_id, "stream consumer loop ended");
    }

    /// One poll cycle: read all three streams concurrently, validate, emit,
    /// ack. Skips entirely if the service is not running or a cycle is still
    /// in flight.
    pub async fn poll_cycle(&self) {
        if !self.lifecycle.is_running() {
            return;
        }
        let Some(_permit) = self.guard.try_acquire() else {
            return;
        };
        self.stats.lock().cycles += 1;

        tokio::join!(
            self.drain_stream(streams::PRICE_UPDATES, StreamKind::Price, self.config.price_batch),
            self.drain_stream(streams::WHALE_ALERTS, StreamKind::Whale, self.config.whale_batch),
            self.drain_stream(
                streams::PENDING_OPPORTUNITIES,
                StreamKind::Pending,
                self.config.pending_batch
            ),
        );
    }

    async fn drain_stream(&self, stream: &str, kind: StreamKind, batch: usize) {
        let entries = match self
            .bus
            .read_group(
                &self.config.group,
                &self.config.instance_id,
                &[stream],
                batch,
                self.config.block_timeout_ms,
            )
            .await
        {
            Ok(entries) => entries,
            Err(e) if e.is_timeout() => return,
            Err(e) => {
                self.stats.lock().bus_errors += 1;
                warn!(stream, error = %e, "stream read failed");
                let _ = self.events.send(StreamEvent::Error(e.to_string())).await;
                return;
            }
        };

        for entry in entries {
            self.process_entry(&entry, kind).await;
        }
    }

    async fn process_entry(&self, entry: &StreamEntry, kind: StreamKind) {
        for item in unwrap_batch(&entry.data) {
            let event = match kind {
                StreamKind::Price => {
                    match validate_price(
                        &item,
                        self.config.min_valid_price,
                        self.config.max_valid_price,
                    ) {
                        Ok(mut update) => {
                            let mut stamps = update.pipeline_timestamps.take().unwrap_or(
                                PipelineTimestamps::default(),
                            );
                            stamps.consumed_at = Some(now_ms());
                            update.pipeline_timestamps = Some(stamps);
                            Some(StreamEvent::Price(update))
                        }
                        Err(reason) => {
                            warn!(stream = %entry.stream, id = %entry.id, %reason, "discarding invalid price");
                            None
                        }
                    }
                }
                StreamKind::Whale => match validate_whale(&item) {
                    Ok(tx) => Some(StreamEvent::Whale(tx)),
                    Err(reason) => {
                        warn!(stream = %entry.stream, id = %entry.id, %reason, "discarding invalid whale alert");
                        None
                    }
                },
                StreamKind::Pending => match validate_pending(&item) {
                    Ok(pending) => Some(StreamEvent::Pending(pending)),
                    Err(reason) => {
                        warn!(stream = %entry.stream, id = %entry.id, %reason, "discarding invalid pending intent");
                        None
                    }
                },
            };

            match event {
                Some(event) => {
                    self.stats.lock().accepted += 1;
                    if self.events.send(event).await.is_err() {
                        debug!("event channel closed; dropping event");
                    }
                }
                None => self.stats.lock().rejected += 1,
            }
        }

        // One ack per stream entry, valid or not. Poison messages leave the
        // pending list the same way healthy ones do.
        if let Err(e) = self.bus.ack(&entry.stream, &self.config.group, &entry.id).await {
            warn!(stream = %entry.stream, id = %entry.id, error = %e, "ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn running_lifecycle() -> Lifecycle {
        let lc = Lifecycle::new("test");
        lc.transition(ServiceState::Starting).unwrap();
        lc.transition(ServiceState::Running).unwrap();
        lc
    }

    fn price_json(price: f64) -> Value {
        json!({
            "chain": "ethereum",
            "dex": "uniswap",
            "pairKey": "WETH_USDC",
            "token0": "WETH",
            "token1": "USDC",
            "price": price,
            "timestamp": 1_700_000_000_000i64
        })
    }

    async fn consumer_with_bus(
        bus: Arc<InMemoryBus>,
    ) -> (StreamConsumer, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let consumer = StreamConsumer::new(
            bus,
            StreamConsumerConfig::default(),
            running_lifecycle(),
            tx,
        );
        consumer.init().await.unwrap();
        (consumer, rx)
    }

    #[tokio::test]
    async fn each_entry_acked_exactly_once() {
        let bus = Arc::new(InMemoryBus::new());
        let batch = json!({"batch": true, "items": [price_json(2500.0), price_json(2501.0)]});
        let id_batch = bus.add(streams::PRICE_UPDATES, &batch).await.unwrap();
        let id_single = bus
            .add(streams::PRICE_UPDATES, &price_json(2502.0))
            .await
            .unwrap();

        let (consumer, mut rx) = consumer_with_bus(bus.clone()).await;
        consumer.poll_cycle().await;

        // Batch entry acks once despite holding two items.
        assert_eq!(bus.ack_count(streams::PRICE_UPDATES, &id_batch), 1);
        assert_eq!(bus.ack_count(streams::PRICE_UPDATES, &id_single), 1);

        let mut prices = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Price(p) = event {
                prices.push(p.price);
            }
        }
        assert_eq!(prices, vec![2500.0, 2501.0, 2502.0]);
    }

    #[tokio::test]
    async fn invalid_item_acked_without_event() {
        let bus = Arc::new(InMemoryBus::new());
        let id = bus
            .add(streams::PRICE_UPDATES, &price_json(-1.0))
            .await
            .unwrap();

        let (consumer, mut rx) = consumer_with_bus(bus.clone()).await;
        consumer.poll_cycle().await;

        assert_eq!(bus.ack_count(streams::PRICE_UPDATES, &id), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(consumer.stats().rejected, 1);
        assert_eq!(consumer.stats().accepted, 0);
    }

    #[tokio::test]
    async fn accepted_price_gets_consumed_at_stamp() {
        let bus = Arc::new(InMemoryBus::new());
        bus.add(streams::PRICE_UPDATES, &price_json(2500.0))
            .await
            .unwrap();

        let (consumer, mut rx) = consumer_with_bus(bus.clone()).await;
        consumer.poll_cycle().await;

        match rx.try_recv().unwrap() {
            StreamEvent::Price(p) => {
                assert!(p.pipeline_timestamps.unwrap().consumed_at.is_some());
            }
            other => panic!("expected price event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn skips_when_not_running() {
        let bus = Arc::new(InMemoryBus::new());
        bus.add(streams::PRICE_UPDATES, &price_json(2500.0))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let consumer = StreamConsumer::new(
            bus.clone(),
            StreamConsumerConfig::default(),
            Lifecycle::new("idle"),
            tx,
        );
        consumer.init().await.unwrap();
        consumer.poll_cycle().await;

        assert_eq!(bus.total_acks(), 0);
        assert!(rx.try_recv().is_err());
    }

    struct FlakyBus {
        error: parking_lot::Mutex<Option<BusError>>,
    }

    #[async_trait]
    impl BusClient for FlakyBus {
        async fn create_consumer_group(&self, _: &str, _: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn read_group(
            &self,
            _: &str,
            _: &str,
            _: &[&str],
            _: usize,
            _: u64,
        ) -> Result<Vec<StreamEntry>, BusError> {
            match self.error.lock().take() {
                Some(e) => Err(e),
                None => Ok(Vec::new()),
            }
        }
        async fn ack(&self, _: &str, _: &str, _: &str) -> Result<(), BusError> {
            Ok(())
        }
        async fn add(&self, _: &str, _: &Value) -> Result<String, BusError> {
            Ok("0-0".into())
        }
        async fn read_recent(&self, _: &str, _: usize) -> Result<Vec<StreamEntry>, BusError> {
            Ok(Vec::new())
        }
        async fn scan(&self, _: &str) -> Result<Vec<String>, BusError> {
            Ok(Vec::new())
        }
        async fn get_value(&self, _: &str) -> Result<Option<Value>, BusError> {
            Ok(None)
        }
        async fn set_value(&self, _: &str, _: &Value, _: Option<u64>) -> Result<(), BusError> {
            Ok(())
        }
        async fn delete(&self, _: &str) -> Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn timeouts_are_silent() {
        let bus = Arc::new(FlakyBus {
            error: parking_lot::Mutex::new(Some(BusError::Timeout)),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let consumer = StreamConsumer::new(
            bus,
            StreamConsumerConfig::default(),
            running_lifecycle(),
            tx,
        );
        consumer.poll_cycle().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(consumer.stats().bus_errors, 0);
    }

    #[tokio::test]
    async fn io_errors_emit_error_event_and_continue() {
        let bus = Arc::new(FlakyBus {
            error: parking_lot::Mutex::new(Some(BusError::Io("connection reset".into()))),
        });
        let (tx, mut rx) = mpsc::channel(16);
        let consumer = StreamConsumer::new(
            bus,
            StreamConsumerConfig::default(),
            running_lifecycle(),
            tx,
        );
        consumer.poll_cycle().await;

        match rx.try_recv().unwrap() {
            StreamEvent::Error(msg) => assert!(msg.contains("connection reset")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(consumer.stats().bus_errors, 1);

        // Next cycle runs normally.
        consumer.poll_cycle().await;
        assert_eq!(consumer.stats().cycles, 2);
    }
}
