//! Job polling with exponential backoff
//!
//! Each worker slot owns one poller. Idle slots back off up to
//! `max_interval`; a submission wakes them early through a shared [`Notify`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, instrument, trace};

use crate::persistence::{ClaimedJob, JobStore, StoreError};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval right after a successful claim
    #[serde(with = "crate::duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling when idle
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was claimable
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Why [`JobPoller::wait`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The backoff interval elapsed
    Elapsed,
    /// A submission woke the poller early
    Woken,
    /// Shutdown was signalled
    Shutdown,
}

/// Claim loop state for one worker slot
pub struct JobPoller {
    store: Arc<dyn JobStore>,
    worker_id: String,
    config: PollerConfig,
    current_interval: Duration,
    wake: Arc<Notify>,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    pub fn new(
        store: Arc<dyn JobStore>,
        worker_id: impl Into<String>,
        config: PollerConfig,
        wake: Arc<Notify>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            current_interval: config.min_interval,
            config,
            wake,
            shutdown_rx,
        }
    }

    /// Try to claim one job
    ///
    /// An empty queue (or every candidate excluded by its resource key) is
    /// `Ok(None)` and grows the backoff; a claim resets it.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self) -> Result<Option<ClaimedJob>, PollerError> {
        if self.is_shutdown() {
            return Err(PollerError::Shutdown);
        }

        match self.store.claim_next(&self.worker_id).await? {
            Some(job) => {
                self.reset_backoff();
                debug!(job_id = %job.id, resource_key = %job.resource_key, "claimed job");
                Ok(Some(job))
            }
            None => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "nothing claimable, backing off"
                );
                Ok(None)
            }
        }
    }

    /// Sleep for the current interval, a wake-up, or shutdown, whichever
    /// comes first
    pub async fn wait(&mut self) -> WaitOutcome {
        let mut shutdown_rx = self.shutdown_rx.clone();
        if *shutdown_rx.borrow() {
            return WaitOutcome::Shutdown;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => WaitOutcome::Elapsed,
            _ = self.wake.notified() => {
                self.reset_backoff();
                WaitOutcome::Woken
            }
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                WaitOutcome::Shutdown
            }
        }
    }

    /// Grow the backoff without polling, e.g. while the circuit is open
    pub fn back_off(&mut self) {
        self.increase_backoff();
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker is shutting down")]
    Shutdown,
}
