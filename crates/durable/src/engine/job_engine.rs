//! Engine facade wiring store, breaker, pool and monitors

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use super::EngineConfig;
use crate::monitor::{
    FreezeDetector, FreezeRecovery, ProcessSupervisor, SignalSupervisor, TimeoutMonitor,
};
use crate::persistence::{
    BatchDetail, BreakerRecord, CancelOutcome, Job, JobFilter, JobStore, NewJob, Pagination,
    QueueStats, RetryingJobStore, StoreError,
};
use crate::reliability::{CircuitBreakerError, SystemCircuitBreaker};
use crate::task::ExecutorFactory;
use crate::worker::{PoolStats, WorkerPool, WorkerPoolError};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("circuit breaker error: {0}")]
    Breaker(#[from] CircuitBreakerError),

    #[error("worker pool error: {0}")]
    Pool(#[from] WorkerPoolError),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Operational snapshot for health checks
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EngineStats {
    pub pool: PoolStats,
    pub queue: QueueStats,
    pub breaker: BreakerRecord,
}

/// Forwards termination to an optional host supervisor after publishing it
/// to [`JobEngine::run_until_frozen`]
struct EngineSupervisor {
    signal: SignalSupervisor,
    host: Option<Arc<dyn ProcessSupervisor>>,
}

impl ProcessSupervisor for EngineSupervisor {
    fn terminate(&self, reason: &str) {
        self.signal.terminate(reason);
        if let Some(host) = &self.host {
            host.terminate(reason);
        }
    }
}

/// The job engine
///
/// Submissions are durable as soon as the call returns; execution happens on
/// the pool in the background.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(PostgresJobStore::new(pool));
/// let engine = JobEngine::new(store, Arc::new(DigestFactory::new()), EngineConfig::from_env());
/// engine.start()?;
///
/// let batch_id = engine
///     .submit_batch(vec![NewJob::new("AAPL", json!({"mode": "daily"}))], json!({}))
///     .await?;
///
/// let reason = engine.run_until_frozen().await;
/// std::process::exit(FREEZE_EXIT_CODE);
/// ```
pub struct JobEngine {
    config: EngineConfig,
    store: Arc<dyn JobStore>,
    breaker: Arc<SystemCircuitBreaker>,
    pool: WorkerPool,
    timeout_monitor: Arc<TimeoutMonitor>,
    freeze_detector: Arc<FreezeDetector>,
    recovery: Arc<FreezeRecovery>,
    frozen: SignalSupervisor,
    shutdown_tx: watch::Sender<bool>,
    monitor_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobEngine {
    /// Engine whose freeze recovery only signals [`run_until_frozen`](Self::run_until_frozen)
    pub fn new(
        store: Arc<dyn JobStore>,
        factory: Arc<dyn ExecutorFactory>,
        config: EngineConfig,
    ) -> Self {
        Self::build(store, factory, config, None)
    }

    /// Engine whose freeze recovery also calls `supervisor`
    pub fn with_supervisor(
        store: Arc<dyn JobStore>,
        factory: Arc<dyn ExecutorFactory>,
        config: EngineConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self::build(store, factory, config, Some(supervisor))
    }

    fn build(
        store: Arc<dyn JobStore>,
        factory: Arc<dyn ExecutorFactory>,
        config: EngineConfig,
        host: Option<Arc<dyn ProcessSupervisor>>,
    ) -> Self {
        let store: Arc<dyn JobStore> =
            Arc::new(RetryingJobStore::new(store, config.write_retry.clone()));
        let breaker = Arc::new(SystemCircuitBreaker::new(
            config.breaker.clone(),
            Arc::clone(&store),
        ));

        let pool = WorkerPool::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            factory,
            config.pool.clone(),
        );

        let frozen = SignalSupervisor::new();
        let recovery = Arc::new(
            FreezeRecovery::new(
                Arc::clone(&store),
                Arc::new(EngineSupervisor {
                    signal: frozen.clone(),
                    host,
                }),
            )
            .with_claim_gate(pool.claim_gate()),
        );
        let timeout_monitor = Arc::new(TimeoutMonitor::new(
            Arc::clone(&store),
            config.timeout.clone(),
            Arc::clone(&recovery),
        ));
        let freeze_detector = Arc::new(FreezeDetector::new(
            Arc::clone(&store),
            Arc::clone(&breaker),
            config.freeze.clone(),
            Arc::clone(&recovery),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            store,
            breaker,
            pool,
            timeout_monitor,
            freeze_detector,
            recovery,
            frozen,
            shutdown_tx,
            monitor_handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The store as seen by the engine, with conflict retries applied
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn breaker(&self) -> &SystemCircuitBreaker {
        &self.breaker
    }

    pub fn timeout_monitor(&self) -> &TimeoutMonitor {
        &self.timeout_monitor
    }

    pub fn freeze_detector(&self) -> &FreezeDetector {
        &self.freeze_detector
    }

    // =========================================================================
    // Submission & status
    // =========================================================================

    /// Enqueue a batch of jobs; returns as soon as they are persisted
    #[instrument(skip(self, jobs, config), fields(jobs = jobs.len()))]
    pub async fn submit_batch(
        &self,
        jobs: Vec<NewJob>,
        config: serde_json::Value,
    ) -> Result<Uuid, EngineError> {
        if jobs.is_empty() {
            return Err(EngineError::InvalidInput(
                "a batch needs at least one job".to_string(),
            ));
        }

        let count = jobs.len();
        let jobs = jobs.into_iter().map(|job| self.with_retry_bound(job)).collect();
        let batch_id = self.store.submit_batch(jobs, config).await?;

        info!(%batch_id, jobs = count, "batch submitted");
        self.pool.wake();
        Ok(batch_id)
    }

    /// Enqueue a standalone job with no batch
    #[instrument(skip(self, job), fields(resource_key = %job.resource_key))]
    pub async fn submit_job(&self, job: NewJob) -> Result<Uuid, EngineError> {
        let job_id = self.store.submit_job(self.with_retry_bound(job)).await?;
        info!(%job_id, "job submitted");
        self.pool.wake();
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, EngineError> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn get_batch(&self, batch_id: Uuid) -> Result<BatchDetail, EngineError> {
        Ok(self.store.get_batch(batch_id).await?)
    }

    pub async fn list_jobs(
        &self,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<Vec<Job>, EngineError> {
        Ok(self.store.list_jobs(filter, pagination).await?)
    }

    /// Cancel a job
    ///
    /// Queued jobs are cancelled at once. Running jobs are asked to stop and
    /// end up `cancelled` when their executor next checks.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let outcome = self.store.cancel_job(job_id).await?;
        if outcome == CancelOutcome::Requested && self.pool.cancel_running(job_id) {
            info!(%job_id, "signalled cancellation to running job");
        }
        Ok(outcome)
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Force the circuit breaker closed
    pub async fn reset_circuit_breaker(&self) -> Result<BreakerRecord, EngineError> {
        let record = self.breaker.reset().await?;
        self.pool.wake();
        Ok(record)
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            pool: self.pool.stats(),
            queue: self.store.queue_stats().await?,
            breaker: self.breaker.state().await?,
        })
    }

    /// Delete terminal jobs that finished more than `older_than` ago
    #[instrument(skip(self))]
    pub async fn purge_finished(&self, older_than: Duration) -> Result<u64, EngineError> {
        let window = chrono::Duration::from_std(older_than)
            .map_err(|_| EngineError::InvalidInput(format!("{:?} is too long", older_than)))?;
        let deleted = self.store.purge_finished(Utc::now() - window).await?;
        info!(deleted, "purged finished jobs");
        Ok(deleted)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the pool and both monitors
    pub fn start(&self) -> Result<(), EngineError> {
        self.pool.start()?;

        self.shutdown_tx.send_replace(false);
        let mut handles = self.monitor_handles.lock();
        handles.push(
            Arc::clone(&self.timeout_monitor).spawn(self.shutdown_tx.subscribe()),
        );
        handles.push(
            Arc::clone(&self.freeze_detector).spawn(self.shutdown_tx.subscribe()),
        );

        info!(
            worker_id = %self.config.pool.worker_id,
            pool_size = self.config.pool.pool_size,
            "job engine started"
        );
        Ok(())
    }

    /// Stop monitors, then drain the pool
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = self.monitor_handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task failed");
            }
        }

        self.pool.shutdown().await?;
        info!("job engine stopped");
        Ok(())
    }

    /// Resolve once freeze recovery has released all claims; returns the reason
    ///
    /// The host should exit with [`FREEZE_EXIT_CODE`](crate::monitor::FREEZE_EXIT_CODE)
    /// right after, without draining: the claims are already back in the queue.
    pub async fn run_until_frozen(&self) -> String {
        self.frozen.wait().await
    }

    /// Whether freeze recovery has run in this process
    pub fn is_frozen(&self) -> bool {
        self.recovery.has_fired()
    }

    fn with_retry_bound(&self, mut job: NewJob) -> NewJob {
        if job.max_retries.is_none() {
            job.max_retries = Some(self.config.retry.max_retries);
        }
        job
    }
}
