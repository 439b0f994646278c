//! Pool-wide freeze detection
//!
//! Individual job timeouts take 45 minutes to notice a dead claim. The
//! freeze detector looks at the pool as a whole: work is waiting, yet no
//! heartbeat has landed anywhere for `threshold`. That points at the
//! execution substrate itself, so recovery is a restart.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, instrument};

use super::supervisor::FreezeRecovery;
use super::MonitorError;
use crate::persistence::JobStore;
use crate::reliability::{CircuitBreakerError, SystemCircuitBreaker};

/// Freeze detector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FreezeConfig {
    /// Pool-wide heartbeat silence that counts as frozen
    #[serde(with = "crate::duration_millis")]
    pub threshold: Duration,

    #[serde(with = "crate::duration_millis")]
    pub interval: Duration,

    /// Failed checks in a row before escalating to recovery
    pub max_consecutive_errors: u32,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(5 * 60),
            interval: Duration::from_secs(60),
            max_consecutive_errors: 5,
        }
    }
}

impl FreezeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
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

/// Result of one liveness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FreezeVerdict {
    /// Nothing queued; silence is expected
    Idle,

    /// Circuit breaker is open, claims are paused on purpose
    Paused,

    Healthy {
        silent_for: Duration,
    },

    Frozen {
        silent_for: Duration,
        queued: u64,
        processing: u64,
    },
}

impl FreezeVerdict {
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen { .. })
    }
}

/// Periodic pool-wide liveness check
pub struct FreezeDetector {
    store: Arc<dyn JobStore>,
    breaker: Arc<SystemCircuitBreaker>,
    config: FreezeConfig,
    recovery: Arc<FreezeRecovery>,
    started_at: DateTime<Utc>,
    consecutive_errors: AtomicU32,
}

impl FreezeDetector {
    pub fn new(
        store: Arc<dyn JobStore>,
        breaker: Arc<SystemCircuitBreaker>,
        config: FreezeConfig,
        recovery: Arc<FreezeRecovery>,
    ) -> Self {
        Self::started_at(store, breaker, config, recovery, Utc::now())
    }

    /// Detector whose silence clock starts at `started_at` rather than now
    pub fn started_at(
        store: Arc<dyn JobStore>,
        breaker: Arc<SystemCircuitBreaker>,
        config: FreezeConfig,
        recovery: Arc<FreezeRecovery>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            breaker,
            config,
            recovery,
            started_at,
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &FreezeConfig {
        &self.config
    }

    /// Judge pool liveness as of `now`
    ///
    /// Silence is measured from the latest of: the newest heartbeat, the
    /// oldest queued job's enqueue time, and detector start. A job submitted
    /// after a long idle period therefore gets a full threshold to be claimed.
    #[instrument(skip(self))]
    pub async fn check_at(&self, now: DateTime<Utc>) -> Result<FreezeVerdict, MonitorError> {
        let probe = self.store.freeze_probe().await?;
        if probe.queued == 0 {
            return Ok(FreezeVerdict::Idle);
        }

        match self.breaker.allow_claim_at(now).await {
            Ok(()) => {}
            Err(CircuitBreakerError::Open { .. }) => return Ok(FreezeVerdict::Paused),
            Err(e) => return Err(e.into()),
        }

        let last_activity = [probe.last_heartbeat_at, probe.oldest_queued_at]
            .into_iter()
            .flatten()
            .fold(self.started_at, |a, b| a.max(b));

        let silent_for = now
            .signed_duration_since(last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);

        if silent_for > self.config.threshold {
            Ok(FreezeVerdict::Frozen {
                silent_for,
                queued: probe.queued,
                processing: probe.processing,
            })
        } else {
            Ok(FreezeVerdict::Healthy { silent_for })
        }
    }

    /// One detector iteration; breaks once recovery has been triggered
    pub async fn tick_at(&self, now: DateTime<Utc>) -> ControlFlow<()> {
        let reason = match self.check_at(now).await {
            Ok(FreezeVerdict::Frozen {
                silent_for,
                queued,
                processing,
            }) => frozen_reason(silent_for, queued, processing),
            Ok(verdict) => {
                debug!(?verdict, "freeze check");
                self.consecutive_errors.store(0, Ordering::Relaxed);
                return ControlFlow::Continue(());
            }
            Err(e) => {
                let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                error!(error = %e, consecutive_errors = errors, "freeze check failed");
                if errors < self.config.max_consecutive_errors {
                    return ControlFlow::Continue(());
                }
                format!("freeze detector failed {} checks in a row: {}", errors, e)
            }
        };

        self.recovery.recover(&reason).await;
        ControlFlow::Break(())
    }

    /// Check on every interval until shutdown or recovery
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
                        debug!("freeze detector: shutdown requested");
                        break;
                    }
                }
            }

            debug!("freeze detector exited");
        })
    }
}

fn frozen_reason(silent_for: Duration, queued: u64, processing: u64) -> String {
    let silent_for = Duration::from_millis(silent_for.as_millis() as u64);
    format!(
        "no heartbeat in the pool for {:?} with {} queued and {} processing jobs",
        silent_for, queued, processing
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::SignalSupervisor;
    use crate::persistence::{InMemoryJobStore, JobStatus, NewJob, ProgressUpdate};
    use crate::reliability::CircuitBreakerConfig;
    use serde_json::json;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        breaker: Arc<SystemCircuitBreaker>,
        detector: FreezeDetector,
        supervisor: SignalSupervisor,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let breaker = Arc::new(SystemCircuitBreaker::new(
            CircuitBreakerConfig::default().with_cache_duration(Duration::ZERO),
            store.clone(),
        ));
        let supervisor = SignalSupervisor::new();
        let recovery = Arc::new(FreezeRecovery::new(
            store.clone(),
            Arc::new(supervisor.clone()),
        ));
        let detector = FreezeDetector::new(
            store.clone(),
            breaker.clone(),
            FreezeConfig::default().with_max_consecutive_errors(2),
            recovery,
        );
        Fixture {
            store,
            breaker,
            detector,
            supervisor,
        }
    }

    fn later(minutes: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(minutes)
    }

    #[test]
    fn test_frozen_reason_keeps_sub_second_silence() {
        assert_eq!(
            frozen_reason(Duration::from_micros(350_400), 2, 1),
            "no heartbeat in the pool for 350ms with 2 queued and 1 processing jobs"
        );
        assert!(frozen_reason(Duration::from_secs(360), 1, 0).contains("for 360s with"));
    }

    #[tokio::test]
    async fn test_empty_queue_never_fires() {
        let f = fixture();
        let verdict = f.detector.check_at(later(60)).await.unwrap();
        assert_eq!(verdict, FreezeVerdict::Idle);
        assert!(f.detector.tick_at(later(60)).await.is_continue());
        assert!(f.supervisor.terminated().is_none());
    }

    #[tokio::test]
    async fn test_recent_heartbeat_is_healthy() {
        let f = fixture();
        f.store
            .submit_batch(
                vec![NewJob::new("AAPL", json!({})), NewJob::new("MSFT", json!({}))],
                json!({}),
            )
            .await
            .unwrap();
        let job = f.store.claim_next("w1").await.unwrap().unwrap();
        f.store
            .heartbeat(job.id, "w1", ProgressUpdate::new("ingest", 10))
            .await
            .unwrap();

        let verdict = f.detector.check_at(later(4)).await.unwrap();
        assert!(matches!(verdict, FreezeVerdict::Healthy { .. }));
    }

    #[tokio::test]
    async fn test_silence_with_queued_work_triggers_recovery() {
        let f = fixture();
        f.store
            .submit_batch(
                vec![NewJob::new("AAPL", json!({})), NewJob::new("MSFT", json!({}))],
                json!({}),
            )
            .await
            .unwrap();
        let stuck = f.store.claim_next("w1").await.unwrap().unwrap();

        let verdict = f.detector.check_at(later(6)).await.unwrap();
        assert!(verdict.is_frozen());

        assert!(f.detector.tick_at(later(6)).await.is_break());
        let reason = f.supervisor.terminated().unwrap();
        assert!(reason.contains("1 queued and 1 processing"));

        let job = f.store.get_job(stuck.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_open_breaker_pauses_detection() {
        let f = fixture();
        f.store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();
        for _ in 0..3 {
            f.breaker.record_system_failure().await.unwrap();
        }

        let verdict = f.detector.check_at(later(4)).await;
        assert!(matches!(verdict, Ok(FreezeVerdict::Paused)));
    }
}
