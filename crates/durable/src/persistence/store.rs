//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::reliability::CircuitState;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(Uuid),

    /// The caller no longer holds the claim on this job (reclaimed, cancelled or finished)
    #[error("claim lost on job {job_id} for worker {worker_id}")]
    ClaimLost { job_id: Uuid, worker_id: String },

    /// Write-write conflict: deadlock, serialization failure or lock timeout
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Store unreachable or exhausted (pool timeout, connection refused, I/O)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A conflicting write kept failing past the retry ceiling
    #[error("{operation} still conflicting after {attempts} attempts")]
    WriteRetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },

    /// Rejected input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same write can succeed once contention clears
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Whether this failure says something about the system rather than one job
    ///
    /// System-level failures feed the circuit breaker.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::WriteRetriesExhausted { .. } | Self::Database(_)
        )
    }
}

/// Job status
///
/// ```text
/// queued ──claim──► processing ──► completed
///    ▲                  │  ├─────► failed (permanent)
///    │                  │  └─────► cancelled
///    └──── timeout / retryable failure (retry_count < max_retries)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,

    /// Claimed by exactly one worker
    Processing,

    /// Finished successfully
    Completed,

    /// Failed permanently, never claimed again
    Failed,

    /// Cancelled by an operator
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Database(format!("unknown job status: {}", other))),
        }
    }
}

/// Definition of a job to be enqueued
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewJob {
    /// Mutual-exclusion key (ticker symbol)
    pub resource_key: String,

    /// Opaque payload handed to the task executor
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Retry bound; the engine's retry policy fills this in when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(resource_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            resource_key: resource_key.into(),
            payload,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), StoreError> {
        if self.resource_key.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "resource_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Phase and progress persisted by a previous attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Checkpoint {
    pub phase: String,
    pub progress: u8,
}

/// A job as stored
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Job {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub resource_key: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Free-form sub-stage label reported by the executor
    pub phase: Option<String>,
    /// 0..=100
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub cancel_requested: bool,
    /// First submission, never changes
    pub submitted_at: DateTime<Utc>,
    /// Entered the queue (reset on every requeue)
    pub queued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_detail: Option<String>,
}

impl Job {
    /// Phase/progress left behind by an earlier attempt, if any
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.phase.as_ref().map(|phase| Checkpoint {
            phase: phase.clone(),
            progress: self.progress,
        })
    }
}

/// Per-status job counts, derived on read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Nothing left to run
    pub fn is_finished(&self) -> bool {
        self.queued == 0 && self.processing == 0
    }
}

/// A batch with its jobs and derived aggregates
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BatchDetail {
    pub id: Uuid,
    /// Submission-time configuration snapshot
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Jobs in submission order
    pub jobs: Vec<Job>,
    pub counts: StatusCounts,
}

impl BatchDetail {
    pub fn job_ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|j| j.id).collect()
    }
}

/// A job that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub resource_key: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub checkpoint: Option<Checkpoint>,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Progress reported with a heartbeat; `None` fields keep their stored value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase: Option<String>,
    pub progress: Option<u8>,
}

impl ProgressUpdate {
    pub fn new(phase: impl Into<String>, progress: u8) -> Self {
        Self {
            phase: Some(phase.into()),
            progress: Some(progress.min(100)),
        }
    }
}

/// Response from heartbeat operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted (caller still holds the claim)
    pub accepted: bool,

    /// Whether the executor should stop: cancellation was requested, or the
    /// claim is gone
    pub should_cancel: bool,
}

/// Failure reported by a claim holder
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub detail: Option<String>,
    pub retryable: bool,
}

/// Outcome of failing a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back in the queue with the incremented counter
    Requeued { retry_count: u32 },

    /// Permanently failed
    Failed { retry_count: u32 },

    /// A pending cancellation request was honoured
    Cancelled,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum CancelOutcome {
    /// The job was queued and is now cancelled
    Cancelled,

    /// The job is running; the executor sees the request at its next checkpoint
    Requested,

    /// Nothing to do, the job already reached a terminal status
    AlreadyFinished { status: JobStatus },
}

/// Parameters for one timeout sweep, all measured against one `now`
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSweep {
    pub now: DateTime<Utc>,
    pub queue_timeout: Duration,
    pub processing_timeout: Duration,
}

impl TimeoutSweep {
    /// Queued before this instant means the queue timeout passed
    pub fn queue_cutoff(&self) -> DateTime<Utc> {
        cutoff(self.now, self.queue_timeout)
    }

    /// Last heartbeat before this instant means the claim is abandoned
    pub fn heartbeat_cutoff(&self) -> DateTime<Utc> {
        cutoff(self.now, self.processing_timeout)
    }
}

pub(crate) fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// What one timeout sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unclaimed past the queue timeout, now permanently failed
    pub queue_expired: Vec<Uuid>,
    /// Stale heartbeat, back in the queue
    pub requeued: Vec<Uuid>,
    /// Stale heartbeat with retries exhausted, now permanently failed
    pub exhausted: Vec<Uuid>,
    /// Stale heartbeat with a pending cancel request, now cancelled
    pub cancelled: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.queue_expired.is_empty()
            && self.requeued.is_empty()
            && self.exhausted.is_empty()
            && self.cancelled.is_empty()
    }
}

/// Pool-wide liveness snapshot read by the freeze detector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreezeProbe {
    pub queued: u64,
    pub processing: u64,
    /// Newest heartbeat anywhere in the store
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Longest-waiting queued job
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Queue depth snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct QueueStats {
    pub counts: StatusCounts,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Persisted circuit breaker row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRecord {
    pub fn closed(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            updated_at: now,
        }
    }
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub resource_key: Option<String>,
    pub batch_id: Option<Uuid>,
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Durable store for batches, jobs and the circuit breaker row
///
/// All coordination between workers goes through this trait: claim
/// exclusivity, resource-key exclusion and breaker state are rows, never
/// in-process memory. Implementations must be thread-safe.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Submission & reads
    // =========================================================================

    /// Create a batch and one queued job per entry; returns the batch id
    async fn submit_batch(
        &self,
        jobs: Vec<NewJob>,
        config: serde_json::Value,
    ) -> Result<Uuid, StoreError>;

    /// Create a standalone queued job (no batch)
    async fn submit_job(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Current state of one job
    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// Batch with its jobs and derived counts
    async fn get_batch(&self, batch_id: Uuid) -> Result<BatchDetail, StoreError>;

    /// List jobs, oldest submission first
    async fn list_jobs(
        &self,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<Vec<Job>, StoreError>;

    /// Cancel a queued job, or flag a running one for cooperative cancellation
    async fn cancel_job(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError>;

    // =========================================================================
    // Claim protocol
    // =========================================================================

    /// Atomically claim the oldest queued job whose resource key is idle
    ///
    /// Returns `None` when nothing is eligible.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError>;

    /// Advance the heartbeat (and optionally phase/progress) of a held claim
    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: ProgressUpdate,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Finish a held claim successfully
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Fail a held claim, applying the retry policy
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: JobFailure,
    ) -> Result<FailureOutcome, StoreError>;

    // =========================================================================
    // Monitors
    // =========================================================================

    /// Apply queue and processing timeouts in one pass
    async fn sweep_timeouts(&self, sweep: TimeoutSweep) -> Result<SweepReport, StoreError>;

    /// Pool-wide liveness snapshot
    async fn freeze_probe(&self) -> Result<FreezeProbe, StoreError>;

    /// Requeue every processing job without touching retry counters
    async fn release_all_processing(&self, reason: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Queue depth per status
    async fn queue_stats(&self) -> Result<QueueStats, StoreError>;

    /// Delete terminal jobs finished before `older_than`; returns deleted count
    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    // =========================================================================
    // Circuit breaker row
    // =========================================================================

    /// Read the breaker row (closed if never written)
    async fn load_breaker(&self) -> Result<BreakerRecord, StoreError>;

    /// Count one system-level failure; opens at `threshold`
    async fn record_breaker_failure(
        &self,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<BreakerRecord, StoreError>;

    /// Reset the consecutive failure counter
    async fn record_breaker_success(&self) -> Result<BreakerRecord, StoreError>;

    /// Force the breaker closed with a zero counter
    async fn close_breaker(&self) -> Result<BreakerRecord, StoreError>;
}
