use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{info, warn};

use crate::bus::{streams, BusClient};
use crate::models::{now_ms, CircuitBreakerEvent};

/// Events fetched from the stream when restoring breaker state on startup.
const RESTORE_EVENT_COUNT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_period_ms: i64,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            // Aligned with ADR-018.
            cooldown_period_ms: 300_000,
            half_open_max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    cooldown_until: i64,
    half_open_attempts: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            cooldown_until: 0,
            half_open_attempts: 0,
        }
    }
}

/// Read-only view of one chain's breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerView {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub cooldown_until: i64,
}

/// Per-chain circuit breakers with state changes persisted onto the bus so a
/// restarting instance does not immediately hammer a sick chain.
pub struct CircuitBreakerManager {
    bus: Arc<dyn BusClient>,
    service: String,
    instance_id: String,
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerManager {
    pub fn new(
        bus: Arc<dyn BusClient>,
        service: impl Into<String>,
        instance_id: impl Into<String>,
        config: BreakerConfig,
    ) -> Self {
        Self {
            bus,
            service: service.into(),
            instance_id: instance_id.into(),
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn view(&self, chain: &str) -> BreakerView {
        let breakers = self.breakers.lock();
        let breaker = breakers.get(chain).copied().unwrap_or_else(Breaker::new);
        BreakerView {
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            cooldown_until: breaker.cooldown_until,
        }
    }

    pub async fn can_execute(&self, chain: &str) -> bool {
        self.can_execute_at(chain, now_ms()).await
    }

    /// Gate a candidate execution. In HALF_OPEN each allowed call consumes a
    /// probe slot until the breaker resolves one way or the other.
    pub async fn can_execute_at(&self, chain: &str, now: i64) -> bool {
        let (allowed, event) = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(chain.to_string()).or_insert_with(Breaker::new);
            match breaker.state {
                BreakerState::Closed => (true, None),
                BreakerState::Open => {
                    if now >= breaker.cooldown_until {
                        let event = transition(
                            breaker,
                            BreakerState::HalfOpen,
                            "Cooldown elapsed",
                            chain,
                            &self.service,
                            &self.instance_id,
                            now,
                        );
                        breaker.half_open_attempts = 1;
                        (true, Some(event))
                    } else {
                        (false, None)
                    }
                }
                BreakerState::HalfOpen => {
                    if breaker.half_open_attempts < self.config.half_open_max_attempts {
                        breaker.half_open_attempts += 1;
                        (true, None)
                    } else {
                        (false, None)
                    }
                }
            }
        };
        if let Some(event) = event {
            self.publish(event).await;
        }
        allowed
    }

    pub async fn record_success(&self, chain: &str) {
        self.record_success_at(chain, now_ms()).await
    }

    pub async fn record_success_at(&self, chain: &str, now: i64) {
        let event = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(chain.to_string()).or_insert_with(Breaker::new);
            match breaker.state {
                BreakerState::Closed => {
                    breaker.consecutive_failures = 0;
                    None
                }
                BreakerState::HalfOpen => {
                    let event = transition(
                        breaker,
                        BreakerState::Closed,
                        "Probe succeeded",
                        chain,
                        &self.service,
                        &self.instance_id,
                        now,
                    );
                    breaker.consecutive_failures = 0;
                    breaker.half_open_attempts = 0;
                    breaker.cooldown_until = 0;
                    Some(event)
                }
                // A success while OPEN changes nothing; the cooldown rules.
                BreakerState::Open => None,
            }
        };
        if let Some(event) = event {
            self.publish(event).await;
        }
    }

    pub async fn record_failure(&self, chain: &str, reason: &str) {
        self.record_failure_at(chain, reason, now_ms()).await
    }

    pub async fn record_failure_at(&self, chain: &str, reason: &str, now: i64) {
        let event = {
            let mut breakers = self.breakers.lock();
            let breaker = breakers.entry(chain.to_string()).or_insert_with(Breaker::new);
            breaker.consecutive_failures += 1;
            match breaker.state {
                BreakerState::Closed => {
                    if breaker.consecutive_failures >= self.config.failure_threshold {
                        breaker.cooldown_until = now + self.config.cooldown_period_ms;
                        Some(transition(
                            breaker,
                            BreakerState::Open,
                            reason,
                            chain,
                            &self.service,
                            &self.instance_id,
                            now,
                        ))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    breaker.cooldown_until = now + self.config.cooldown_period_ms;
                    breaker.half_open_attempts = 0;
                    Some(transition(
                        breaker,
                        BreakerState::Open,
                        "Probe failed",
                        chain,
                        &self.service,
                        &self.instance_id,
                        now,
                    ))
                }
                BreakerState::Open => None,
            }
        };
        if let Some(event) = event {
            self.publish(event).await;
        }
    }

    /// Re-open breakers for chains whose most recent persisted event was an
    /// OPEN still inside its cooldown window.
    pub async fn restore_from_stream(&self) {
        self.restore_from_stream_at(now_ms()).await
    }

    pub async fn restore_from_stream_at(&self, now: i64) {
        let entries = match self
            .bus
            .read_recent(streams::CIRCUIT_BREAKER, RESTORE_EVENT_COUNT)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "could not read circuit breaker history");
                return;
            }
        };

        // Entries arrive newest first: the first event per chain is the
        // latest word on that chain.
        let mut seen: HashSet<String> = HashSet::new();
        let mut restored = Vec::new();
        for entry in entries {
            let Ok(event) = serde_json::from_value::<CircuitBreakerEvent>(entry.data.clone()) else {
                continue;
            };
            if !seen.insert(event.chain.clone()) {
                continue;
            }
            if event.new_state == "OPEN" && now - event.timestamp < self.config.cooldown_period_ms {
                restored.push(event);
            }
        }

        for event in restored {
            let publish_event = {
                let mut breakers = self.breakers.lock();
                let breaker = breakers
                    .entry(event.chain.clone())
                    .or_insert_with(Breaker::new);
                breaker.consecutive_failures = event.consecutive_failures;
                breaker.cooldown_until = event.timestamp + self.config.cooldown_period_ms;
                transition(
                    breaker,
                    BreakerState::Open,
                    "Restored from restart",
                    &event.chain,
                    &self.service,
                    &self.instance_id,
                    now,
                )
            };
            info!(chain = %publish_event.chain, "circuit breaker restored open");
            self.publish(publish_event).await;
        }
    }

    async fn publish(&self, event: CircuitBreakerEvent) {
        info!(
            chain = %event.chain,
            from = %event.previous_state,
            to = %event.new_state,
            reason = %event.reason,
            "circuit breaker transition"
        );
        if let Err(e) = self.bus.add(streams::CIRCUIT_BREAKER, &json!(event)).await {
            warn!(chain = %event.chain, error = %e, "failed to publish breaker event");
        }
    }
}

fn transition(
    breaker: &mut Breaker,
    to: BreakerState,
    reason: &str,
    chain: &str,
    service: &str,
    instance_id: &str,
    now: i64,
) -> CircuitBreakerEvent {
    let previous = breaker.state;
    breaker.state = to;
    CircuitBreakerEvent {
        service: service.to_string(),
        instance_id: instance_id.to_string(),
        chain: chain.to_string(),
        previous_state: previous.as_str().to_string(),
        new_state: to.as_str().to_string(),
        reason: reason.to_string(),
        timestamp: now,
        consecutive_failures: breaker.consecutive_failures,
        cooldown_remaining_ms: (breaker.cooldown_until - now).max(0),
    }
}
