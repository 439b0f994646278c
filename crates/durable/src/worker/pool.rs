//! Fixed-size worker pool
//!
//! Each slot is an independent loop: gate on the circuit breaker, claim one
//! job, run it with a freshly created executor, report the outcome, repeat.
//! Slots share nothing but the store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::gate::ClaimGate;
use super::poller::{JobPoller, PollerConfig, PollerError, WaitOutcome};
use crate::persistence::{
    ClaimedJob, FailureOutcome, JobFailure, JobStore, ProgressUpdate, StoreError,
};
use crate::reliability::{CircuitBreakerError, SystemCircuitBreaker};
use crate::task::{CancellationHandle, ExecutorFactory, JobContext, TaskError, TaskErrorKind};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Base worker ID; slot `i` claims as `{worker_id}-slot-{i}`
    pub worker_id: String,

    /// Number of concurrent execution slots
    pub pool_size: usize,

    pub poller: PollerConfig,

    /// Buffered progress reports per running job
    pub progress_buffer: usize,

    /// How long shutdown waits for running jobs
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            pool_size: 3,
            poller: PollerConfig::default(),
            progress_buffer: 16,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_progress_buffer(mut self, capacity: usize) -> Self {
        self.progress_buffer = capacity.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Worker ID used by slot `slot` when claiming
    pub fn slot_worker_id(&self, slot: usize) -> String {
        format!("{}-slot-{}", self.worker_id, slot)
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    Starting,
    /// Slots are claiming jobs
    Running,
    /// Finishing running jobs, no new claims
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Jobs were still running at the deadline; their slots were aborted and
    /// the claims are left to the timeout monitor
    #[error("graceful shutdown timed out with {active} jobs still running")]
    ShutdownTimeout { active: usize },
}

/// A job currently held by one of the pool's slots
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ActiveJob {
    pub job_id: Uuid,
    pub slot: usize,
    pub worker_id: String,
    pub resource_key: String,
    pub claimed_at: DateTime<Utc>,
    #[serde(skip)]
    cancel: CancellationHandle,
}

/// Pool occupancy and lifetime counters
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolStats {
    pub status: WorkerPoolStatus,
    pub pool_size: usize,
    pub busy_slots: usize,
    pub active_jobs: Vec<ActiveJob>,
    pub claimed: u64,
    pub completed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub claims_lost: u64,
    pub refused_by_breaker: u64,
}

#[derive(Default)]
struct PoolActivity {
    active: Mutex<HashMap<Uuid, ActiveJob>>,
    claimed: AtomicU64,
    completed: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    claims_lost: AtomicU64,
    refused_by_breaker: AtomicU64,
}

impl PoolActivity {
    fn begin(&self, slot: usize, job: &ClaimedJob, cancel: CancellationHandle) {
        self.claimed.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            job.id,
            ActiveJob {
                job_id: job.id,
                slot,
                worker_id: job.worker_id.clone(),
                resource_key: job.resource_key.clone(),
                claimed_at: job.claimed_at,
                cancel,
            },
        );
    }

    fn end(&self, job_id: Uuid) {
        self.active.lock().remove(&job_id);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared {
    store: Arc<dyn JobStore>,
    breaker: Arc<SystemCircuitBreaker>,
    factory: Arc<dyn ExecutorFactory>,
    config: WorkerPoolConfig,
    activity: PoolActivity,
    wake: Arc<Notify>,
    gate: Arc<ClaimGate>,
}

/// Bounded pool of job execution slots
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(
///     store.clone(),
///     breaker.clone(),
///     Arc::new(|_slot| Box::new(DigestExecutor::new()) as Box<dyn TaskExecutor>),
///     WorkerPoolConfig::new().with_pool_size(4),
/// );
///
/// pool.start()?;
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    slot_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        breaker: Arc<SystemCircuitBreaker>,
        factory: Arc<dyn ExecutorFactory>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                store,
                breaker,
                factory,
                config,
                activity: PoolActivity::default(),
                wake: Arc::new(Notify::new()),
                gate: Arc::new(ClaimGate::new()),
            }),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            slot_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one loop per slot
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        info!(
            worker_id = %self.shared.config.worker_id,
            pool_size = self.shared.config.pool_size,
            "starting worker pool"
        );

        self.shutdown_tx.send_replace(false);

        let mut handles = self.slot_handles.lock();
        for slot in 0..self.shared.config.pool_size {
            let shared = Arc::clone(&self.shared);
            let shutdown_rx = self.shutdown_tx.subscribe();
            let worker_id = self.shared.config.slot_worker_id(slot);
            let span = tracing::info_span!("slot", %worker_id);
            handles.push(tokio::spawn(
                slot_loop(shared, slot, worker_id, shutdown_rx).instrument(span),
            ));
        }

        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Stop claiming and wait for running jobs to finish
    #[instrument(skip(self), fields(worker_id = %self.shared.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.shared.config.worker_id, "initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.slot_handles.lock().drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let drained = tokio::time::timeout(
            self.shared.config.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await;

        let result = match drained {
            Ok(_) => {
                debug!("all slots exited");
                Ok(())
            }
            Err(_) => {
                let active = self.shared.activity.active.lock().len();
                warn!(active, "shutdown timeout reached, aborting slots");
                for abort in aborts {
                    abort.abort();
                }
                self.shared.activity.active.lock().clear();
                Err(WorkerPoolError::ShutdownTimeout { active })
            }
        };

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.shared.config.worker_id, "worker pool stopped");
        result
    }

    /// Wake idle slots so a fresh submission is claimed without waiting for
    /// the backoff to elapse
    pub fn wake(&self) {
        self.shared.wake.notify_waiters();
        self.shared.wake.notify_one();
    }

    /// Signal cooperative cancellation to a job running in this pool
    ///
    /// Returns whether the job was running here.
    pub fn cancel_running(&self, job_id: Uuid) -> bool {
        match self.shared.activity.active.lock().get(&job_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Gate every slot passes before claiming; once closed the pool never
    /// claims again, even after a restart
    pub fn claim_gate(&self) -> Arc<ClaimGate> {
        Arc::clone(&self.shared.gate)
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn busy_slots(&self) -> usize {
        self.shared.activity.active.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let activity = &self.shared.activity;
        let mut active_jobs: Vec<ActiveJob> = activity.active.lock().values().cloned().collect();
        active_jobs.sort_by_key(|j| j.slot);

        PoolStats {
            status: self.status(),
            pool_size: self.shared.config.pool_size,
            busy_slots: active_jobs.len(),
            active_jobs,
            claimed: activity.claimed.load(Ordering::Relaxed),
            completed: activity.completed.load(Ordering::Relaxed),
            requeued: activity.requeued.load(Ordering::Relaxed),
            failed: activity.failed.load(Ordering::Relaxed),
            cancelled: activity.cancelled.load(Ordering::Relaxed),
            claims_lost: activity.claims_lost.load(Ordering::Relaxed),
            refused_by_breaker: activity.refused_by_breaker.load(Ordering::Relaxed),
        }
    }
}

async fn slot_loop(
    shared: Arc<Shared>,
    slot: usize,
    worker_id: String,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut poller = JobPoller::new(
        Arc::clone(&shared.store),
        worker_id,
        shared.config.poller.clone(),
        Arc::clone(&shared.wake),
        shutdown_rx,
    );

    loop {
        if poller.is_shutdown() {
            break;
        }
        let Some(permit) = shared.gate.enter().await else {
            debug!(slot, "claim gate closed");
            break;
        };

        match shared.breaker.allow_claim().await {
            Ok(()) => match poller.poll().await {
                Ok(Some(job)) => {
                    drop(permit);
                    run_job(&shared, slot, job).await;
                    continue;
                }
                Ok(None) => {}
                Err(PollerError::Shutdown) => break,
                Err(PollerError::Store(e)) => {
                    error!(error = %e, "claim failed");
                    if e.is_system() {
                        record_system_failure(&shared).await;
                    }
                }
            },
            Err(CircuitBreakerError::Open { retry_at, .. }) => {
                PoolActivity::bump(&shared.activity.refused_by_breaker);
                debug!(%retry_at, "circuit open, not claiming");
                poller.back_off();
            }
            Err(e) => {
                warn!(error = %e, "could not read circuit breaker state");
                poller.back_off();
            }
        }

        drop(permit);
        if poller.wait().await == WaitOutcome::Shutdown {
            break;
        }
    }

    debug!(slot, "slot loop exited");
}

/// Execute one claimed job and record its outcome
#[instrument(skip(shared, job), fields(job_id = %job.id, resource_key = %job.resource_key, worker_id = %job.worker_id))]
async fn run_job(shared: &Shared, slot: usize, job: ClaimedJob) {
    let (progress_tx, progress_rx) = mpsc::channel(shared.config.progress_buffer);
    let ctx = JobContext::for_claim(&job).with_progress(progress_tx);
    let cancel = ctx.cancellation_handle();
    shared.activity.begin(slot, &job, cancel.clone());

    info!(retry_count = job.retry_count, "job started");

    let forwarder = tokio::spawn(forward_progress(
        Arc::clone(&shared.store),
        job.id,
        job.worker_id.clone(),
        progress_rx,
        cancel,
    ));

    let outcome = match shared.factory.create(slot) {
        Ok(executor) => {
            let outcome = AssertUnwindSafe(executor.execute(
                &ctx,
                &job.resource_key,
                job.payload.clone(),
            ))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(TaskError::business(panic_message(panic))));

            executor.teardown().await;
            outcome
        }
        Err(e) => Err(e),
    };

    // Closing the channel lets the forwarder flush and exit before the final
    // transition, so no heartbeat lands after it.
    drop(ctx);
    if let Err(e) = forwarder.await {
        warn!(error = %e, "progress forwarder failed");
    }

    match outcome {
        Ok(result) => finish_success(shared, &job, result).await,
        Err(err) => finish_failure(shared, &job, err).await,
    }

    shared.activity.end(job.id);
}

async fn forward_progress(
    store: Arc<dyn JobStore>,
    job_id: Uuid,
    worker_id: String,
    mut rx: mpsc::Receiver<ProgressUpdate>,
    cancel: CancellationHandle,
) {
    while let Some(update) = rx.recv().await {
        match store.heartbeat(job_id, &worker_id, update).await {
            Ok(response) => {
                if response.should_cancel && !cancel.is_cancelled() {
                    if response.accepted {
                        info!(%job_id, "cancellation requested");
                    } else {
                        warn!(%job_id, "claim no longer held, stopping job");
                    }
                    cancel.cancel();
                }
            }
            Err(e) => warn!(%job_id, error = %e, "heartbeat write failed"),
        }
    }
}

async fn finish_success(shared: &Shared, job: &ClaimedJob, result: serde_json::Value) {
    match shared
        .store
        .complete_job(job.id, &job.worker_id, result)
        .await
    {
        Ok(()) => {
            info!("job completed");
            PoolActivity::bump(&shared.activity.completed);
            if let Err(e) = shared.breaker.record_success().await {
                warn!(error = %e, "could not record breaker success");
            }
        }
        Err(e) => finish_store_error(shared, e, "complete").await,
    }
}

async fn finish_failure(shared: &Shared, job: &ClaimedJob, err: TaskError) {
    match err.kind {
        TaskErrorKind::Cancelled => info!("job stopped after cancellation"),
        TaskErrorKind::Business => warn!(error = %err, "job failed permanently"),
        TaskErrorKind::Infrastructure => warn!(error = %err, "job failed, retryable"),
    }

    let failure = JobFailure {
        message: err.message.clone(),
        detail: err.detail.clone(),
        retryable: err.is_retryable(),
    };

    match shared.store.fail_job(job.id, &job.worker_id, failure).await {
        Ok(outcome) => {
            let counter = match outcome {
                FailureOutcome::Requeued { retry_count } => {
                    info!(retry_count, "job requeued");
                    &shared.activity.requeued
                }
                FailureOutcome::Failed { retry_count } => {
                    warn!(retry_count, "job marked failed");
                    &shared.activity.failed
                }
                FailureOutcome::Cancelled => &shared.activity.cancelled,
            };
            PoolActivity::bump(counter);
        }
        Err(e) => finish_store_error(shared, e, "fail").await,
    }

    if err.is_system_level() {
        record_system_failure(shared).await;
    }
}

async fn finish_store_error(shared: &Shared, e: StoreError, transition: &str) {
    match e {
        StoreError::ClaimLost { .. } => {
            warn!(transition, "claim lost before the job finished, result dropped");
            PoolActivity::bump(&shared.activity.claims_lost);
        }
        e => {
            error!(transition, error = %e, "could not record job outcome");
            if e.is_system() {
                record_system_failure(shared).await;
            }
        }
    }
}

async fn record_system_failure(shared: &Shared) {
    if let Err(e) = shared.breaker.record_system_failure().await {
        warn!(error = %e, "could not record breaker failure");
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("executor panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryJobStore, JobStatus, NewJob};
    use crate::reliability::{CircuitBreakerConfig, CircuitState};
    use crate::task::TaskExecutor;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    fn fast_config(pool_size: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new()
            .with_worker_id("test")
            .with_pool_size(pool_size)
            .with_poller(
                PollerConfig::new()
                    .with_min_interval(Duration::from_millis(5))
                    .with_max_interval(Duration::from_millis(20)),
            )
            .with_shutdown_timeout(Duration::from_secs(5))
    }

    fn pool_with<E>(store: Arc<InMemoryJobStore>, pool_size: usize, make: E) -> WorkerPool
    where
        E: Fn() -> Box<dyn TaskExecutor> + Send + Sync + 'static,
    {
        let breaker = Arc::new(SystemCircuitBreaker::new(
            CircuitBreakerConfig::default().with_cache_duration(Duration::ZERO),
            store.clone(),
        ));
        let factory: Arc<dyn ExecutorFactory> = Arc::new(move |_slot: usize| make());
        WorkerPool::new(store, breaker, factory, fast_config(pool_size))
    }

    async fn wait_for(store: &InMemoryJobStore, job_id: Uuid, status: JobStatus) {
        for _ in 0..500 {
            if store.get_job(job_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", job_id, status);
    }

    struct Digest;

    #[async_trait]
    impl TaskExecutor for Digest {
        async fn execute(
            &self,
            ctx: &JobContext,
            resource_key: &str,
            _payload: Value,
        ) -> Result<Value, TaskError> {
            ctx.report_progress("ingest", 30).await?;
            ctx.report_progress("email", 90).await?;
            Ok(json!({ "ticker": resource_key }))
        }
    }

    struct Failing(TaskError);

    #[async_trait]
    impl TaskExecutor for Failing {
        async fn execute(&self, _: &JobContext, _: &str, _: Value) -> Result<Value, TaskError> {
            Err(self.0.clone())
        }
    }

    struct Panicking;

    #[async_trait]
    impl TaskExecutor for Panicking {
        async fn execute(&self, _: &JobContext, _: &str, _: Value) -> Result<Value, TaskError> {
            panic!("feed parser blew up");
        }
    }

    struct UntilCancelled;

    #[async_trait]
    impl TaskExecutor for UntilCancelled {
        async fn execute(&self, ctx: &JobContext, _: &str, _: Value) -> Result<Value, TaskError> {
            loop {
                ctx.heartbeat().await?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new()
            .with_worker_id("digest-1")
            .with_pool_size(0)
            .with_progress_buffer(4);

        assert_eq!(config.pool_size, 1);
        assert_eq!(config.progress_buffer, 4);
        assert_eq!(config.slot_worker_id(2), "digest-1-slot-2");
    }

    #[tokio::test]
    async fn test_runs_job_to_completion() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let pool = pool_with(store.clone(), 2, || Box::new(Digest));
        pool.start().unwrap();
        wait_for(&store, job_id, JobStatus::Completed).await;
        pool.shutdown().await.unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.result, Some(json!({ "ticker": "AAPL" })));
        assert_eq!(job.phase.as_deref(), Some("email"));
        assert_eq!(job.progress, 90);
        assert!(job.worker_id.unwrap().starts_with("test-slot-"));

        let stats = pool.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.busy_slots, 0);
        assert_eq!(stats.status, WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_business_failure_is_permanent_and_not_counted() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .submit_job(NewJob::new("NOPE", json!({})))
            .await
            .unwrap();

        let pool = pool_with(store.clone(), 1, || {
            Box::new(Failing(TaskError::business("unknown ticker")))
        });
        pool.start().unwrap();
        wait_for(&store, job_id, JobStatus::Failed).await;
        pool.shutdown().await.unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.error_message.as_deref(), Some("unknown ticker"));
        assert_eq!(store.load_breaker().await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failures_retry_then_open_breaker() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool = pool_with(store.clone(), 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::new(Failing(TaskError::classify("upstream error", Some(503))))
        });
        pool.start().unwrap();
        wait_for(&store, job_id, JobStatus::Failed).await;
        pool.shutdown().await.unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.retry_count, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(pool.stats().requeued, 2);

        let breaker = store.load_breaker().await.unwrap();
        assert_eq!(breaker.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_breaker_refuses_claims() {
        let store = Arc::new(InMemoryJobStore::new());
        for _ in 0..3 {
            store.record_breaker_failure(3, Utc::now()).await.unwrap();
        }
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let pool = pool_with(store.clone(), 2, || Box::new(Digest));
        pool.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown().await.unwrap();

        assert_eq!(store.get_job(job_id).await.unwrap().status, JobStatus::Queued);
        assert!(pool.stats().refused_by_breaker > 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_permanent_failure() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let pool = pool_with(store.clone(), 1, || Box::new(Panicking));
        pool.start().unwrap();
        wait_for(&store, job_id, JobStatus::Failed).await;
        pool.shutdown().await.unwrap();

        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(
            job.error_message.as_deref(),
            Some("executor panicked: feed parser blew up")
        );
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        let pool = pool_with(store.clone(), 1, || Box::new(UntilCancelled));
        pool.start().unwrap();
        wait_for(&store, job_id, JobStatus::Processing).await;

        store.cancel_job(job_id).await.unwrap();
        wait_for(&store, job_id, JobStatus::Cancelled).await;
        pool.shutdown().await.unwrap();

        assert_eq!(pool.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_closed_gate_stops_claims_for_good() {
        let store = Arc::new(InMemoryJobStore::new());
        let pool = pool_with(store.clone(), 2, || Box::new(Digest));
        pool.claim_gate().close().await;
        pool.start().unwrap();

        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();
        pool.wake();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.get_job(job_id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(pool.stats().claimed, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_shutdown_idempotent() {
        let store = Arc::new(InMemoryJobStore::new());
        let pool = pool_with(store, 1, || Box::new(Digest));

        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));
        assert_eq!(pool.status(), WorkerPoolStatus::Running);

        pool.shutdown().await.unwrap();
        pool.shutdown().await.unwrap();
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);

        pool.start().unwrap();
        pool.shutdown().await.unwrap();
    }
}
