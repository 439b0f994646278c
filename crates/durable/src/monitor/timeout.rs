//! Two-phase timeout monitor
//!
//! Periodically fails jobs left queued past the queue timeout and reclaims
//! jobs whose heartbeat went stale past the processing timeout. Every
//! transition happens inside the store against the single `now` read here.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::supervisor::FreezeRecovery;
use crate::persistence::{JobStore, StoreError, SweepReport, TimeoutSweep};

/// Timeout monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Unclaimed longer than this fails permanently
    #[serde(with = "crate::duration_millis")]
    pub queue_timeout: Duration,

    /// No heartbeat for longer than this means the claim is abandoned
    #[serde(with = "crate::duration_millis")]
    pub processing_timeout: Duration,

    /// Sweep cadence
    #[serde(with = "crate::duration_millis")]
    pub interval: Duration,

    /// Failed sweeps in a row before escalating to freeze recovery
    pub max_consecutive_errors: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(4 * 60 * 60),
            processing_timeout: Duration::from_secs(45 * 60),
            interval: Duration::from_secs(60),
            max_consecutive_errors: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max.max(1);
        self
    }
}

/// Background sweep over queued and processing jobs
pub struct TimeoutMonitor {
    store: Arc<dyn JobStore>,
    config: TimeoutConfig,
    recovery: Arc<FreezeRecovery>,
    consecutive_errors: AtomicU32,
}

impl TimeoutMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: TimeoutConfig,
        recovery: Arc<FreezeRecovery>,
    ) -> Self {
        Self {
            store,
            config,
            recovery,
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Run one sweep as of `now`
    #[instrument(skip(self))]
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let report = self
            .store
            .sweep_timeouts(TimeoutSweep {
                now,
                queue_timeout: self.config.queue_timeout,
                processing_timeout: self.config.processing_timeout,
            })
            .await?;

        for job_id in &report.queue_expired {
            warn!(%job_id, "queue timeout, job failed without being claimed");
        }
        for job_id in &report.requeued {
            warn!(%job_id, "processing timeout, job requeued");
        }
        for job_id in &report.exhausted {
            error!(%job_id, "processing timeout with no retries left, job failed");
        }
        for job_id in &report.cancelled {
            info!(%job_id, "processing timeout on a cancelled job");
        }
        if report.is_empty() {
            debug!("timeout sweep found nothing");
        }

        Ok(report)
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// One monitor iteration; breaks once the error budget is spent and
    /// freeze recovery has been triggered
    pub async fn tick_at(&self, now: DateTime<Utc>) -> ControlFlow<()> {
        match self.sweep_at(now).await {
            Ok(_) => {
                self.consecutive_errors.store(0, Ordering::Relaxed);
                ControlFlow::Continue(())
            }
            Err(e) => {
                let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                error!(error = %e, consecutive_errors = errors, "timeout sweep failed");

                if errors >= self.config.max_consecutive_errors {
                    let reason = format!("timeout monitor failed {} sweeps in a row: {}", errors, e);
                    self.recovery.recover(&reason).await;
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
        }
    }

    /// Sweep on every interval until shutdown or escalation
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.tick_at(Utc::now()).await.is_break() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("timeout monitor: shutdown requested");
                        break;
                    }
                }
            }

            debug!("timeout monitor exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SignalSupervisor;
    use crate::persistence::{FaultKind, InMemoryJobStore, JobStatus, NewJob};
    use serde_json::json;

    fn monitor(store: Arc<InMemoryJobStore>) -> (TimeoutMonitor, SignalSupervisor) {
        let supervisor = SignalSupervisor::new();
        let recovery = Arc::new(FreezeRecovery::new(
            store.clone(),
            Arc::new(supervisor.clone()),
        ));
        let config = TimeoutConfig::default().with_max_consecutive_errors(2);
        (TimeoutMonitor::new(store, config, recovery), supervisor)
    }

    fn minutes(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    #[test]
    fn test_default_config() {
        let config = TimeoutConfig::default();
        assert_eq!(config.queue_timeout, Duration::from_secs(14_400));
        assert_eq!(config.processing_timeout, Duration::from_secs(2_700));
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.max_consecutive_errors, 5);
    }

    #[tokio::test]
    async fn test_fresh_claim_survives_sweep() {
        let store = Arc::new(InMemoryJobStore::new());
        let (monitor, _) = monitor(store.clone());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();
        store.claim_next("w1").await.unwrap();

        let report = monitor.sweep_at(Utc::now() + minutes(44)).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            store.get_job(job_id).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn test_silent_job_times_out_until_exhausted() {
        let store = Arc::new(InMemoryJobStore::new());
        let (monitor, _) = monitor(store.clone());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            store.claim_next("w1").await.unwrap().unwrap();
            let report = monitor.sweep_at(Utc::now() + minutes(46)).await.unwrap();
            let job = store.get_job(job_id).await.unwrap();

            if attempt < 3 {
                assert_eq!(report.requeued, vec![job_id]);
                assert_eq!(job.status, JobStatus::Queued);
            } else {
                assert_eq!(report.exhausted, vec![job_id]);
                assert_eq!(job.status, JobStatus::Failed);
            }
            assert_eq!(job.retry_count, attempt);
        }

        assert!(store.claim_next("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_timeout_fails_without_retry() {
        let store = Arc::new(InMemoryJobStore::new());
        let (monitor, _) = monitor(store.clone());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let report = monitor
            .sweep_at(Utc::now() + minutes(4 * 60 + 1))
            .await
            .unwrap();
        assert_eq!(report.queue_expired, vec![job_id]);

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_repeated_errors_escalate_to_recovery() {
        let store = Arc::new(InMemoryJobStore::new());
        let (monitor, supervisor) = monitor(store.clone());

        store.inject_faults(FaultKind::Unavailable, 1);
        assert!(monitor.tick_at(Utc::now()).await.is_continue());
        assert!(monitor.tick_at(Utc::now()).await.is_continue());
        assert!(supervisor.terminated().is_none());

        store.inject_faults(FaultKind::Unavailable, 2);
        assert!(monitor.tick_at(Utc::now()).await.is_continue());
        assert!(monitor.tick_at(Utc::now()).await.is_break());

        let reason = supervisor.terminated().unwrap();
        assert!(reason.contains("2 sweeps in a row"));
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let (monitor, _) = monitor(store);
        let (tx, rx) = watch::channel(false);

        let handle = Arc::new(monitor).spawn(rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
