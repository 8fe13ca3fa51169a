use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{
    open_signed, sign_envelope, BusClient, SignedEnvelope, BRIDGE_RECOVERY_PREFIX,
};
use crate::lifecycle::{Lifecycle, OperationGuard, ServiceState};
use crate::models::{now_ms, BridgeRecoveryState, BridgeStatus};

use super::router::{BridgeRouterFactory, RouterStatus};

/// Terminal states stay readable for an hour of post-mortem.
const TERMINAL_TTL_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub check_interval_ms: u64,
    /// Bridges older than this are abandoned outright.
    pub max_age_ms: i64,
    pub max_concurrent_recoveries: usize,
    /// None means HMAC signing is disabled globally.
    pub hmac_key: Option<Vec<u8>>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            max_age_ms: 24 * 60 * 60 * 1000,
            max_concurrent_recoveries: 3,
            hmac_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryCounters {
    pub scans: u64,
    pub recovered_bridges: u64,
    pub failed_recoveries: u64,
    pub abandoned_bridges: u64,
}

/// Scans persisted bridge checkpoints and advances, abandons, or confirms
/// them. The sell leg of a completed bridge belongs to the execution engine
/// (it owns the wallets); this manager only confirms bridge completion.
pub struct BridgeRecoveryManager {
    bus: Arc<dyn BusClient>,
    routers: Arc<BridgeRouterFactory>,
    config: RecoveryConfig,
    lifecycle: Lifecycle,
    checking: OperationGuard,
    counters: Mutex<RecoveryCounters>,
}

impl BridgeRecoveryManager {
    pub fn new(
        bus: Arc<dyn BusClient>,
        routers: Arc<BridgeRouterFactory>,
        config: RecoveryConfig,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            bus,
            routers,
            config,
            lifecycle,
            checking: OperationGuard::new(),
            counters: Mutex::new(RecoveryCounters::default()),
        }
    }

    pub fn counters(&self) -> RecoveryCounters {
        *self.counters.lock()
    }

    fn key_for(bridge_id: &str) -> String {
        format!("{BRIDGE_RECOVERY_PREFIX}{bridge_id}")
    }

    /// Persist a checkpoint, HMAC-wrapped when signing is enabled. Terminal
    /// states get the short post-mortem TTL, active states live for the
    /// abandonment window.
    pub async fn persist(&self, state: &BridgeRecoveryState) {
        let ttl = if state.status.is_terminal() {
            TERMINAL_TTL_SECS
        } else {
            (self.config.max_age_ms / 1000).max(1) as u64
        };
        let payload = match serde_json::to_value(state) {
            Ok(payload) => payload,
            Err(e) => {
                error!(bridge_id = %state.bridge_id, error = %e, "unserializable recovery state");
                return;
            }
        };
        let value = match &self.config.hmac_key {
            Some(key) => match serde_json::to_value(sign_envelope(&payload, key)) {
                Ok(wrapped) => wrapped,
                Err(e) => {
                    error!(bridge_id = %state.bridge_id, error = %e, "envelope serialization failed");
                    return;
                }
            },
            None => payload,
        };
        if let Err(e) = self
            .bus
            .set_value(&Self::key_for(&state.bridge_id), &value, Some(ttl))
            .await
        {
            warn!(bridge_id = %state.bridge_id, error = %e, "failed to persist recovery state");
        }
    }

    /// Scan forever on the configured interval, one initial pass first.
    pub async fn run(self: Arc<Self>) {
        self.clone().scan_once().await;
        loop {
            tokio::time::sleep(Duration::from_millis(self.config.check_interval_ms)).await;
            match self.lifecycle.state() {
                ServiceState::Stopping | ServiceState::Stopped | ServiceState::Error => break,
                ServiceState::Running => self.clone().scan_once().await,
                _ => {}
            }
        }
        debug!("bridge recovery loop ended");
    }

    /// One full scan cycle. Overlapping invocations are dropped.
    pub async fn scan_once(self: Arc<Self>) {
        let Some(_permit) = self.checking.try_acquire() else {
            return;
        };
        self.counters.lock().scans += 1;

        let keys = match self.bus.scan(&format!("{BRIDGE_RECOVERY_PREFIX}*")).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "recovery key scan failed");
                return;
            }
        };

        let mut actionable = Vec::new();
        for key in keys {
            if let Some(state) = self.load_state(&key).await {
                if state.status.is_actionable() {
                    actionable.push(state);
                }
            }
        }
        if actionable.is_empty() {
            return;
        }
        debug!(count = actionable.len(), "processing recoverable bridges");

        for chunk in actionable.chunks(self.config.max_concurrent_recoveries) {
            let mut tasks = tokio::task::JoinSet::new();
            for state in chunk.iter().cloned() {
                let manager = Arc::clone(&self);
                tasks.spawn(async move { manager.process_state(state).await });
            }
            // allSettled: a panicking task must not sink its batch mates.
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "recovery task aborted");
                }
            }
        }
    }

    /// Decode one persisted entry, enforcing the envelope policy.
    async fn load_state(&self, key: &str) -> Option<BridgeRecoveryState> {
        let value = match self.bus.get_value(key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "failed to read recovery entry");
                return None;
            }
        };

        let payload = if looks_like_envelope(&value) {
            let envelope: SignedEnvelope = match serde_json::from_value(value) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(key, error = %e, "corrupt recovery envelope; deleting");
                    let _ = self.bus.delete(key).await;
                    return None;
                }
            };
            match &self.config.hmac_key {
                Some(hmac_key) => match open_signed(&envelope, hmac_key) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(key, error = %e, "recovery entry failed verification; skipping");
                        return None;
                    }
                },
                None => {
                    warn!(key, "signed recovery entry but signing is disabled; accepting payload");
                    envelope.value
                }
            }
        } else {
            if self.config.hmac_key.is_some() {
                warn!(key, "unsigned recovery entry with signing enabled; skipping");
                return None;
            }
            value
        };

        match serde_json::from_value(payload) {
            Ok(state) => Some(state),
            Err(e) => {
                error!(key, error = %e, "corrupt recovery entry; deleting");
                let _ = self.bus.delete(key).await;
                None
            }
        }
    }

    async fn process_state(&self, mut state: BridgeRecoveryState) {
        let now = now_ms();
        let age = now - state.initiated_at;
        if age > self.config.max_age_ms {
            state.status = BridgeStatus::Failed;
            state.error_message = Some("Bridge abandoned: exceeded max age".to_string());
            state.last_check_at = Some(now);
            self.persist(&state).await;
            self.counters.lock().abandoned_bridges += 1;
            warn!(
                bridge_id = %state.bridge_id,
                age_hours = age / 3_600_000,
                "bridge abandoned"
            );
            return;
        }

        let Some(router) = self.routers.find_supported_router(
            &state.source_chain,
            &state.dest_chain,
            &state.bridge_token,
        ) else {
            // Router sets are config-driven; one may appear later. Not a
            // failure.
            debug!(
                bridge_id = %state.bridge_id,
                source = %state.source_chain,
                dest = %state.dest_chain,
                "no supporting router for recovery yet"
            );
            return;
        };

        if state.status == BridgeStatus::BridgeCompletedSellPending {
            self.attempt_sell_recovery(&state, router.as_ref()).await;
            return;
        }

        let status = match router.get_status(&state.bridge_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(bridge_id = %state.bridge_id, error = %e, "bridge status check failed");
                return;
            }
        };

        match status {
            RouterStatus::Completed => {
                state.status = BridgeStatus::Recovered;
                state.last_check_at = Some(now);
                self.persist(&state).await;
                self.counters.lock().recovered_bridges += 1;
                info!(bridge_id = %state.bridge_id, "bridge recovered");
            }
            RouterStatus::Failed => {
                state.status = BridgeStatus::Failed;
                state.error_message = Some("Bridge reported failed".to_string());
                state.last_check_at = Some(now);
                self.persist(&state).await;
                self.counters.lock().failed_recoveries += 1;
                warn!(bridge_id = %state.bridge_id, "bridge failed");
            }
            RouterStatus::Refunded => {
                state.status = BridgeStatus::Failed;
                state.error_message = Some("Bridge refunded at source".to_string());
                state.last_check_at = Some(now);
                self.persist(&state).await;
                self.counters.lock().failed_recoveries += 1;
                warn!(bridge_id = %state.bridge_id, "bridge refunded");
            }
            RouterStatus::Pending => {
                state.status = BridgeStatus::Pending;
                state.last_check_at = Some(now);
                self.persist(&state).await;
            }
            RouterStatus::Bridging => {
                state.status = BridgeStatus::Bridging;
                state.last_check_at = Some(now);
                self.persist(&state).await;
            }
        }
    }

    /// Confirm completion for a bridge whose sell leg is still owed. The
    /// sell itself is executed by the execution engine; state is left as-is.
    async fn attempt_sell_recovery(
        &self,
        state: &BridgeRecoveryState,
        router: &dyn super::router::BridgeRouter,
    ) {
        match router.get_status(&state.bridge_id).await {
            Ok(RouterStatus::Completed) => {
                info!(
                    bridge_id = %state.bridge_id,
                    sell_dex = %state.sell_dex,
                    "bridge completion confirmed; sell leg pending with execution engine"
                );
            }
            Ok(status) => {
                debug!(bridge_id = %state.bridge_id, ?status, "sell-pending bridge not complete yet");
            }
            Err(e) => {
                warn!(bridge_id = %state.bridge_id, error = %e, "sell-recovery status check failed");
            }
        }
    }
}

fn looks_like_envelope(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.contains_key("value") && obj.contains_key("mac"))
        .unwrap_or(false)
}
