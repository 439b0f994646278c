//! In-memory implementation of JobStore for testing

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::reliability::{CircuitState, RetryDecision, DEFAULT_MAX_RETRIES};

/// Kind of error produced by [`InMemoryJobStore::inject_faults`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Behaves like a deadlock / serialization failure
    Conflict,
    /// Behaves like an unreachable database
    Unavailable,
}

impl FaultKind {
    fn to_error(self, operation: &str) -> StoreError {
        match self {
            Self::Conflict => {
                StoreError::Conflict(format!("injected deadlock during {}", operation))
            }
            Self::Unavailable => {
                StoreError::Unavailable(format!("injected outage during {}", operation))
            }
        }
    }
}

struct JobRow {
    job: Job,
    /// Insertion order, tie-breaker for equal timestamps
    seq: u64,
}

struct BatchRow {
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    job_ids: Vec<Uuid>,
}

struct Inner {
    jobs: HashMap<Uuid, JobRow>,
    batches: HashMap<Uuid, BatchRow>,
    breaker: BreakerRecord,
    next_seq: u64,
    faults: Option<(FaultKind, u32)>,
}

impl Inner {
    /// Consume one injected fault, if any are pending
    fn check_fault(&mut self, operation: &str) -> Result<(), StoreError> {
        match self.faults.take() {
            Some((kind, remaining)) if remaining > 0 => {
                if remaining > 1 {
                    self.faults = Some((kind, remaining - 1));
                }
                Err(kind.to_error(operation))
            }
            _ => Ok(()),
        }
    }

    fn insert_job(&mut self, batch_id: Option<Uuid>, new_job: NewJob, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::now_v7();
        let seq = self.next_seq;
        self.next_seq += 1;

        let job = Job {
            id,
            batch_id,
            resource_key: new_job.resource_key,
            payload: new_job.payload,
            status: JobStatus::Queued,
            phase: None,
            progress: 0,
            retry_count: 0,
            max_retries: new_job.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            cancel_requested: false,
            submitted_at: now,
            queued_at: now,
            claimed_at: None,
            last_heartbeat_at: None,
            finished_at: None,
            worker_id: None,
            result: None,
            error_message: None,
            error_detail: None,
        };
        self.jobs.insert(id, JobRow { job, seq });
        id
    }

    /// The job, if `worker_id` still holds its claim
    fn held_claim(&mut self, job_id: Uuid, worker_id: &str) -> Result<&mut Job, StoreError> {
        let row = self
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if row.job.status != JobStatus::Processing
            || row.job.worker_id.as_deref() != Some(worker_id)
        {
            return Err(StoreError::ClaimLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(&mut row.job)
    }
}

fn finish(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.finished_at = Some(now);
}

fn requeue(job: &mut Job, retry_count: u32, now: DateTime<Utc>) {
    job.status = JobStatus::Queued;
    job.retry_count = retry_count;
    job.queued_at = now;
    job.claimed_at = None;
    job.worker_id = None;
}

/// In-memory implementation of JobStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation, plus a
/// fault-injection hook for exercising the write wrapper and the breaker.
///
/// # Example
///
/// ```
/// use stockdigest_durable::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                batches: HashMap::new(),
                breaker: BreakerRecord::closed(Utc::now()),
                next_seq: 0,
                faults: None,
            }),
        }
    }

    /// Number of stored jobs
    pub fn job_count(&self) -> usize {
        self.inner.read().jobs.len()
    }

    /// Number of jobs currently processing
    pub fn processing_count(&self) -> usize {
        self.inner
            .read()
            .jobs
            .values()
            .filter(|r| r.job.status == JobStatus::Processing)
            .count()
    }

    /// Fail the next `count` job writes with the given error kind
    pub fn inject_faults(&self, kind: FaultKind, count: u32) {
        self.inner.write().faults = (count > 0).then_some((kind, count));
    }

    /// Injected faults not yet consumed
    pub fn pending_faults(&self) -> u32 {
        self.inner.read().faults.map(|(_, n)| n).unwrap_or(0)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.jobs.clear();
        inner.batches.clear();
        inner.breaker = BreakerRecord::closed(Utc::now());
        inner.faults = None;
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit_batch(
        &self,
        jobs: Vec<NewJob>,
        config: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        for job in &jobs {
            job.validate()?;
        }

        let mut inner = self.inner.write();
        inner.check_fault("submit_batch")?;

        let now = Utc::now();
        let batch_id = Uuid::now_v7();
        let job_ids = jobs
            .into_iter()
            .map(|job| inner.insert_job(Some(batch_id), job, now))
            .collect();

        inner.batches.insert(
            batch_id,
            BatchRow {
                config,
                created_at: now,
                job_ids,
            },
        );
        Ok(batch_id)
    }

    async fn submit_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        job.validate()?;

        let mut inner = self.inner.write();
        inner.check_fault("submit_job")?;
        Ok(inner.insert_job(None, job, Utc::now()))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.inner
            .read()
            .jobs
            .get(&job_id)
            .map(|r| r.job.clone())
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<BatchDetail, StoreError> {
        let inner = self.inner.read();
        let batch = inner
            .batches
            .get(&batch_id)
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        let jobs: Vec<Job> = batch
            .job_ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|r| r.job.clone())
            .collect();

        let mut counts = StatusCounts::default();
        for job in &jobs {
            counts.add(job.status);
        }

        Ok(BatchDetail {
            id: batch_id,
            config: batch.config.clone(),
            created_at: batch.created_at,
            jobs,
            counts,
        })
    }

    async fn list_jobs(
        &self,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<&JobRow> = inner
            .jobs
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.job.status == s))
            .filter(|r| {
                filter
                    .resource_key
                    .as_deref()
                    .map_or(true, |k| r.job.resource_key == k)
            })
            .filter(|r| filter.batch_id.map_or(true, |b| r.job.batch_id == Some(b)))
            .collect();
        rows.sort_by_key(|r| (r.job.submitted_at, r.seq));

        Ok(rows
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .map(|r| r.job.clone())
            .collect())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("cancel_job")?;

        let row = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let job = &mut row.job;

        match job.status {
            JobStatus::Queued => {
                finish(job, JobStatus::Cancelled, Utc::now());
                job.cancel_requested = true;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Processing => {
                job.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            status => Ok(CancelOutcome::AlreadyFinished { status }),
        }
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("claim_next")?;

        let busy_keys: HashSet<&str> = inner
            .jobs
            .values()
            .filter(|r| r.job.status == JobStatus::Processing)
            .map(|r| r.job.resource_key.as_str())
            .collect();

        let candidate = inner
            .jobs
            .values()
            .filter(|r| r.job.status == JobStatus::Queued)
            .filter(|r| !busy_keys.contains(r.job.resource_key.as_str()))
            .min_by_key(|r| (r.job.queued_at, r.seq))
            .map(|r| r.job.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let now = Utc::now();
        let Some(row) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let job = &mut row.job;
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.last_heartbeat_at = Some(now);

        Ok(Some(ClaimedJob {
            id: job.id,
            batch_id: job.batch_id,
            resource_key: job.resource_key.clone(),
            payload: job.payload.clone(),
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            checkpoint: job.checkpoint(),
            worker_id: worker_id.to_string(),
            claimed_at: now,
        }))
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: ProgressUpdate,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("heartbeat")?;

        let row = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        let job = &mut row.job;

        if job.status != JobStatus::Processing || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(HeartbeatResponse {
                accepted: false,
                should_cancel: true,
            });
        }

        job.last_heartbeat_at = Some(Utc::now());
        if let Some(phase) = update.phase {
            job.phase = Some(phase);
        }
        if let Some(progress) = update.progress {
            job.progress = progress.min(100);
        }

        Ok(HeartbeatResponse {
            accepted: true,
            should_cancel: job.cancel_requested,
        })
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("complete_job")?;

        let job = inner.held_claim(job_id, worker_id)?;
        let now = Utc::now();
        job.last_heartbeat_at = Some(now);
        job.progress = 100;
        job.result = Some(result);
        finish(job, JobStatus::Completed, now);
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: JobFailure,
    ) -> Result<FailureOutcome, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("fail_job")?;

        let job = inner.held_claim(job_id, worker_id)?;
        let now = Utc::now();
        job.last_heartbeat_at = Some(now);
        job.error_message = Some(failure.message);
        job.error_detail = failure.detail;

        if job.cancel_requested {
            finish(job, JobStatus::Cancelled, now);
            return Ok(FailureOutcome::Cancelled);
        }

        if !failure.retryable {
            finish(job, JobStatus::Failed, now);
            return Ok(FailureOutcome::Failed {
                retry_count: job.retry_count,
            });
        }

        match RetryDecision::after_failure(job.retry_count, job.max_retries) {
            RetryDecision::Requeue { retry_count } => {
                requeue(job, retry_count, now);
                Ok(FailureOutcome::Requeued { retry_count })
            }
            RetryDecision::Exhausted { retry_count } => {
                job.retry_count = retry_count;
                finish(job, JobStatus::Failed, now);
                Ok(FailureOutcome::Failed { retry_count })
            }
        }
    }

    async fn sweep_timeouts(&self, sweep: TimeoutSweep) -> Result<SweepReport, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("sweep_timeouts")?;

        let queue_cutoff = sweep.queue_cutoff();
        let heartbeat_cutoff = sweep.heartbeat_cutoff();
        let mut report = SweepReport::default();

        for row in inner.jobs.values_mut() {
            let job = &mut row.job;
            match job.status {
                JobStatus::Queued if job.queued_at < queue_cutoff => {
                    job.error_message = Some(format!(
                        "queue timeout: not claimed within {}s",
                        sweep.queue_timeout.as_secs()
                    ));
                    finish(job, JobStatus::Failed, sweep.now);
                    report.queue_expired.push(job.id);
                }
                JobStatus::Processing => {
                    let last_seen = job.last_heartbeat_at.or(job.claimed_at);
                    if last_seen.map_or(true, |t| t >= heartbeat_cutoff) {
                        continue;
                    }

                    let message = format!(
                        "processing timeout: no heartbeat for {}s from {}",
                        sweep.processing_timeout.as_secs(),
                        job.worker_id.as_deref().unwrap_or("unknown worker")
                    );
                    job.error_message = Some(message);

                    if job.cancel_requested {
                        finish(job, JobStatus::Cancelled, sweep.now);
                        report.cancelled.push(job.id);
                        continue;
                    }

                    match RetryDecision::after_failure(job.retry_count, job.max_retries) {
                        RetryDecision::Requeue { retry_count } => {
                            requeue(job, retry_count, sweep.now);
                            report.requeued.push(job.id);
                        }
                        RetryDecision::Exhausted { retry_count } => {
                            job.retry_count = retry_count;
                            finish(job, JobStatus::Failed, sweep.now);
                            report.exhausted.push(job.id);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(report)
    }

    async fn freeze_probe(&self) -> Result<FreezeProbe, StoreError> {
        let inner = self.inner.read();
        let mut probe = FreezeProbe::default();
        for row in inner.jobs.values() {
            match row.job.status {
                JobStatus::Queued => {
                    probe.queued += 1;
                    probe.oldest_queued_at = Some(match probe.oldest_queued_at {
                        Some(oldest) => oldest.min(row.job.queued_at),
                        None => row.job.queued_at,
                    });
                }
                JobStatus::Processing => probe.processing += 1,
                _ => {}
            }
            probe.last_heartbeat_at = probe.last_heartbeat_at.max(row.job.last_heartbeat_at);
        }
        Ok(probe)
    }

    async fn release_all_processing(&self, reason: &str) -> Result<Vec<Uuid>, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("release_all_processing")?;

        let now = Utc::now();
        let mut released = Vec::new();
        for row in inner.jobs.values_mut() {
            let job = &mut row.job;
            if job.status == JobStatus::Processing {
                let retry_count = job.retry_count;
                requeue(job, retry_count, now);
                job.error_message = Some(reason.to_string());
                released.push(job.id);
            }
        }
        Ok(released)
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.read();
        let mut stats = QueueStats::default();
        for row in inner.jobs.values() {
            stats.counts.add(row.job.status);
            if row.job.status == JobStatus::Queued {
                stats.oldest_queued_at = match stats.oldest_queued_at {
                    Some(t) if t <= row.job.queued_at => Some(t),
                    _ => Some(row.job.queued_at),
                };
            }
        }
        Ok(stats)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        inner.check_fault("purge_finished")?;

        let before = inner.jobs.len();
        inner.jobs.retain(|_, r| {
            !(r.job.status.is_terminal() && r.job.finished_at.is_some_and(|t| t < older_than))
        });
        let purged = (before - inner.jobs.len()) as u64;

        let Inner { jobs, batches, .. } = &mut *inner;
        batches.retain(|_, b| b.job_ids.iter().any(|id| jobs.contains_key(id)));

        Ok(purged)
    }

    async fn load_breaker(&self) -> Result<BreakerRecord, StoreError> {
        Ok(self.inner.read().breaker.clone())
    }

    async fn record_breaker_failure(
        &self,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<BreakerRecord, StoreError> {
        let mut inner = self.inner.write();
        let breaker = &mut inner.breaker;
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        if breaker.state == CircuitState::Closed && breaker.consecutive_failures >= threshold {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(now);
        }
        breaker.updated_at = now;
        Ok(breaker.clone())
    }

    async fn record_breaker_success(&self) -> Result<BreakerRecord, StoreError> {
        let mut inner = self.inner.write();
        let breaker = &mut inner.breaker;
        if breaker.consecutive_failures > 0 {
            breaker.consecutive_failures = 0;
            breaker.updated_at = Utc::now();
        }
        Ok(breaker.clone())
    }

    async fn close_breaker(&self) -> Result<BreakerRecord, StoreError> {
        let mut inner = self.inner.write();
        let breaker = &mut inner.breaker;
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.updated_at = Utc::now();
        Ok(breaker.clone())
    }
}
