//! JobStore decorator applying the deadlock-aware write wrapper
//!
//! Every mutating call runs through [`retry_on_conflict`]; reads pass
//! straight through. Callers see either the result, the original non-conflict
//! error, or [`StoreError::WriteRetriesExhausted`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::*;
use crate::reliability::{retry_on_conflict, StoreConflicts, WriteRetryPolicy};

/// Wraps any [`JobStore`] so its writes survive deadlocks and serialization
/// failures
///
/// ```
/// use std::sync::Arc;
/// use stockdigest_durable::persistence::{InMemoryJobStore, RetryingJobStore};
/// use stockdigest_durable::WriteRetryPolicy;
///
/// let store = RetryingJobStore::new(Arc::new(InMemoryJobStore::new()), WriteRetryPolicy::default());
/// assert_eq!(store.policy().max_attempts, 100);
/// ```
pub struct RetryingJobStore {
    inner: Arc<dyn JobStore>,
    policy: WriteRetryPolicy,
}

impl RetryingJobStore {
    pub fn new(inner: Arc<dyn JobStore>, policy: WriteRetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &WriteRetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &Arc<dyn JobStore> {
        &self.inner
    }
}

#[async_trait]
impl JobStore for RetryingJobStore {
    async fn submit_batch(
        &self,
        jobs: Vec<NewJob>,
        config: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        Ok(
            retry_on_conflict("submit_batch", &self.policy, &StoreConflicts, || {
                self.inner.submit_batch(jobs.clone(), config.clone())
            })
            .await?,
        )
    }

    async fn submit_job(&self, job: NewJob) -> Result<Uuid, StoreError> {
        Ok(
            retry_on_conflict("submit_job", &self.policy, &StoreConflicts, || {
                self.inner.submit_job(job.clone())
            })
            .await?,
        )
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<BatchDetail, StoreError> {
        self.inner.get_batch(batch_id).await
    }

    async fn list_jobs(
        &self,
        filter: JobFilter,
        pagination: Pagination,
    ) -> Result<Vec<Job>, StoreError> {
        self.inner.list_jobs(filter, pagination).await
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<CancelOutcome, StoreError> {
        Ok(
            retry_on_conflict("cancel_job", &self.policy, &StoreConflicts, || {
                self.inner.cancel_job(job_id)
            })
            .await?,
        )
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        Ok(
            retry_on_conflict("claim_next", &self.policy, &StoreConflicts, || {
                self.inner.claim_next(worker_id)
            })
            .await?,
        )
    }

    async fn heartbeat(
        &self,
        job_id: Uuid,
        worker_id: &str,
        update: ProgressUpdate,
    ) -> Result<HeartbeatResponse, StoreError> {
        Ok(
            retry_on_conflict("heartbeat", &self.policy, &StoreConflicts, || {
                self.inner.heartbeat(job_id, worker_id, update.clone())
            })
            .await?,
        )
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        Ok(
            retry_on_conflict("complete_job", &self.policy, &StoreConflicts, || {
                self.inner.complete_job(job_id, worker_id, result.clone())
            })
            .await?,
        )
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        failure: JobFailure,
    ) -> Result<FailureOutcome, StoreError> {
        Ok(
            retry_on_conflict("fail_job", &self.policy, &StoreConflicts, || {
                self.inner.fail_job(job_id, worker_id, failure.clone())
            })
            .await?,
        )
    }

    async fn sweep_timeouts(&self, sweep: TimeoutSweep) -> Result<SweepReport, StoreError> {
        Ok(
            retry_on_conflict("sweep_timeouts", &self.policy, &StoreConflicts, || {
                self.inner.sweep_timeouts(sweep)
            })
            .await?,
        )
    }

    async fn freeze_probe(&self) -> Result<FreezeProbe, StoreError> {
        self.inner.freeze_probe().await
    }

    async fn release_all_processing(&self, reason: &str) -> Result<Vec<Uuid>, StoreError> {
        Ok(
            retry_on_conflict("release_all_processing", &self.policy, &StoreConflicts, || {
                self.inner.release_all_processing(reason)
            })
            .await?,
        )
    }

    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        self.inner.queue_stats().await
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(
            retry_on_conflict("purge_finished", &self.policy, &StoreConflicts, || {
                self.inner.purge_finished(older_than)
            })
            .await?,
        )
    }

    async fn load_breaker(&self) -> Result<BreakerRecord, StoreError> {
        self.inner.load_breaker().await
    }

    async fn record_breaker_failure(
        &self,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<BreakerRecord, StoreError> {
        Ok(
            retry_on_conflict("record_breaker_failure", &self.policy, &StoreConflicts, || {
                self.inner.record_breaker_failure(threshold, now)
            })
            .await?,
        )
    }

    async fn record_breaker_success(&self) -> Result<BreakerRecord, StoreError> {
        Ok(
            retry_on_conflict("record_breaker_success", &self.policy, &StoreConflicts, || {
                self.inner.record_breaker_success()
            })
            .await?,
        )
    }

    async fn close_breaker(&self) -> Result<BreakerRecord, StoreError> {
        Ok(
            retry_on_conflict("close_breaker", &self.policy, &StoreConflicts, || {
                self.inner.close_breaker()
            })
            .await?,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{FaultKind, InMemoryJobStore};
    use serde_json::json;
    use std::time::Duration;

    fn fast_policy(max_attempts: u32) -> WriteRetryPolicy {
        WriteRetryPolicy::default()
            .with_initial_backoff(Duration::from_millis(1))
            .with_max_backoff(Duration::from_millis(2))
            .with_max_attempts(max_attempts)
    }

    #[tokio::test]
    async fn test_conflicting_claim_is_retried() {
        let memory = Arc::new(InMemoryJobStore::new());
        let store = RetryingJobStore::new(memory.clone(), fast_policy(10));
        let job_id = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap();

        memory.inject_faults(FaultKind::Conflict, 5);
        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(memory.pending_faults(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_as_system_error() {
        let memory = Arc::new(InMemoryJobStore::new());
        let store = RetryingJobStore::new(memory.clone(), fast_policy(3));

        memory.inject_faults(FaultKind::Conflict, 10);
        let err = store
            .submit_job(NewJob::new("AAPL", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StoreError::WriteRetriesExhausted { attempts: 3, .. }
        ));
        assert!(err.is_system());
        assert_eq!(memory.pending_faults(), 7);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let memory = Arc::new(InMemoryJobStore::new());
        let store = RetryingJobStore::new(memory.clone(), fast_policy(10));

        memory.inject_faults(FaultKind::Unavailable, 2);
        let err = store.claim_next("w1").await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(memory.pending_faults(), 1);
    }
}
