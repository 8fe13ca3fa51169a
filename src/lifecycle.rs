//! Service lifecycle state machine and single-flight operation guard.
//!
//! Every long-running component (detector, stream consumer, recovery manager)
//! shares the same lifecycle: Idle -> Starting -> Running -> Stopping ->
//! Stopped, with Error as a terminal escape hatch for fatal failures. Stopped
//! services may be started again; init hooks run once per start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Idle => "IDLE",
            ServiceState::Starting => "STARTING",
            ServiceState::Running => "RUNNING",
            ServiceState::Stopping => "STOPPING",
            ServiceState::Stopped => "STOPPED",
            ServiceState::Error => "ERROR",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal lifecycle transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ServiceState,
    pub to: ServiceState,
}

/// Shared lifecycle handle. Cheap to clone; all clones observe the same state.
#[derive(Clone)]
pub struct Lifecycle {
    name: &'static str,
    state: Arc<RwLock<ServiceState>>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(RwLock::new(ServiceState::Idle)),
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServiceState::Running
    }

    /// Move to `to`, enforcing the legal transition set. Error is reachable
    /// from every state; everything else follows the start/stop cycle.
    pub fn transition(&self, to: ServiceState) -> Result<(), TransitionError> {
        let mut state = self.state.write();
        let from = *state;
        let legal = match (from, to) {
            (_, ServiceState::Error) => true,
            (ServiceState::Idle, ServiceState::Starting) => true,
            (ServiceState::Stopped, ServiceState::Starting) => true,
            (ServiceState::Starting, ServiceState::Running) => true,
            (ServiceState::Running, ServiceState::Stopping) => true,
            (ServiceState::Stopping, ServiceState::Stopped) => true,
            // stop() must be safe to call from any state; pre-run states
            // collapse straight to Stopped.
            (ServiceState::Idle, ServiceState::Stopped) => true,
            (ServiceState::Starting, ServiceState::Stopped) => true,
            (ServiceState::Stopped, ServiceState::Stopped) => true,
            _ => false,
        };
        if !legal {
            return Err(TransitionError { from, to });
        }
        if from != to {
            info!(service = self.name, from = from.as_str(), to = to.as_str(), "lifecycle transition");
        }
        *state = to;
        Ok(())
    }

    /// Idempotent stop: whatever state we are in, end up Stopped (Error is
    /// left alone so the failure reason stays visible).
    pub fn force_stop(&self) {
        let mut state = self.state.write();
        if *state == ServiceState::Error {
            return;
        }
        if *state != ServiceState::Stopped {
            info!(service = self.name, from = state.as_str(), to = "STOPPED", "lifecycle transition");
        }
        *state = ServiceState::Stopped;
    }
}

/// Compare-and-set busy flag with RAII release. Used to keep detector ticks
/// and consumer poll cycles from overlapping.
#[derive(Clone, Default)]
pub struct OperationGuard {
    busy: Arc<AtomicBool>,
}

impl OperationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the guard, or None if an operation is already in flight.
    pub fn try_acquire(&self) -> Option<OperationPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(OperationPermit {
                busy: self.busy.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct OperationPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
