//! Background monitors
//!
//! - [`TimeoutMonitor`] - queue timeout and processing (heartbeat) timeout sweep
//! - [`FreezeDetector`] - pool-wide heartbeat silence while work is waiting
//! - [`FreezeRecovery`] - release every claim, then hand the process to its
//!   [`ProcessSupervisor`] for a restart
//!
//! Both monitors escalate to freeze recovery after repeated internal errors
//! rather than leaving the queue unmonitored.

mod freeze;
mod supervisor;
mod timeout;

pub use freeze::{FreezeConfig, FreezeDetector, FreezeVerdict};
pub use supervisor::{
    ExitSupervisor, FreezeRecovery, ProcessSupervisor, SignalSupervisor, FREEZE_EXIT_CODE,
};
pub use timeout::{TimeoutConfig, TimeoutMonitor};

use crate::persistence::StoreError;
use crate::reliability::CircuitBreakerError;

/// Errors from a single monitor check
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("circuit breaker error: {0}")]
    Breaker(#[from] CircuitBreakerError),
}
