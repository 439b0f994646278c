//! Crash-only recovery
//!
//! When the pool is suspected wedged the engine does not try to repair
//! itself: it releases every processing claim and asks the
//! [`ProcessSupervisor`] to end the process. Restarting is the job of
//! whatever runs the process (systemd, Kubernetes, a process manager).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::persistence::JobStore;
use crate::worker::ClaimGate;

/// Exit status used when the process terminates itself after a freeze
/// (`EX_TEMPFAIL`: the supervisor should restart it)
pub const FREEZE_EXIT_CODE: i32 = 75;

/// Collaborator that ends the process so an external manager restarts it
pub trait ProcessSupervisor: Send + Sync {
    fn terminate(&self, reason: &str);
}

/// Exits the process immediately with [`FREEZE_EXIT_CODE`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitSupervisor;

impl ProcessSupervisor for ExitSupervisor {
    fn terminate(&self, reason: &str) {
        error!(reason, exit_code = FREEZE_EXIT_CODE, "terminating process for restart");
        std::process::exit(FREEZE_EXIT_CODE);
    }
}

/// Publishes the termination request instead of exiting
///
/// Lets the host finish its own teardown (flush telemetry, close the pool)
/// before exiting, and lets tests observe the request.
#[derive(Debug, Clone)]
pub struct SignalSupervisor {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for SignalSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSupervisor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Reason given by the first termination request, if any
    pub fn terminated(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Wait until termination is requested; returns the reason
    pub async fn wait(&self) -> String {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return String::from("supervisor dropped");
            }
        }
    }
}

impl ProcessSupervisor for SignalSupervisor {
    fn terminate(&self, reason: &str) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }
}

/// Release every claim, then terminate; runs at most once
pub struct FreezeRecovery {
    store: Arc<dyn JobStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    gate: Option<Arc<ClaimGate>>,
    fired: AtomicBool,
}

impl FreezeRecovery {
    pub fn new(store: Arc<dyn JobStore>, supervisor: Arc<dyn ProcessSupervisor>) -> Self {
        Self {
            store,
            supervisor,
            gate: None,
            fired: AtomicBool::new(false),
        }
    }

    /// Close `gate` before releasing, so the live pool cannot re-claim the
    /// jobs handed back to the queue
    pub fn with_claim_gate(mut self, gate: Arc<ClaimGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Returns `false` if recovery already ran
    ///
    /// Termination is requested even when releasing the claims fails; the
    /// timeout monitor of the restarted process reclaims them later.
    pub async fn recover(&self, reason: &str) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(gate) = &self.gate {
            gate.close().await;
        }
        error!(reason, "pool frozen, releasing all processing claims");
        match self.store.release_all_processing(reason).await {
            Ok(released) => warn!(count = released.len(), "released processing claims"),
            Err(e) => error!(error = %e, "could not release processing claims"),
        }

        self.supervisor.terminate(reason);
        true
    }
}
