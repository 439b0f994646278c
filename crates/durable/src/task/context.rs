//! Job execution context

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::TaskError;
use crate::persistence::{Checkpoint, ClaimedJob, ProgressUpdate};

/// Error from progress reports
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    /// Progress channel closed (the engine stopped listening for this job)
    #[error("progress channel closed")]
    ChannelClosed,

    /// Cancellation was requested, or the claim was lost
    #[error("job was cancelled")]
    Cancelled,
}

impl From<ProgressError> for TaskError {
    fn from(err: ProgressError) -> Self {
        match err {
            ProgressError::Cancelled => TaskError::cancelled(),
            ProgressError::ChannelClosed => TaskError::infrastructure(err.to_string()),
        }
    }
}

/// Context provided to task executors during execution
///
/// The context provides:
/// - Information about the claimed job and the current attempt
/// - The checkpoint left by an earlier attempt, if any
/// - Progress reporting, persisted as heartbeat + phase + progress
/// - Cooperative cancellation
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &JobContext, ticker: &str, payload: Value) -> Result<Value, TaskError> {
///     for (i, feed) in feeds.iter().enumerate() {
///         if ctx.is_cancelled() {
///             return Err(TaskError::cancelled());
///         }
///         ingest(feed).await?;
///         ctx.report_progress("ingest", (i * 50 / feeds.len()) as u8).await?;
///     }
///     Ok(json!({}))
/// }
/// ```
#[derive(Debug)]
pub struct JobContext {
    pub job_id: Uuid,

    pub batch_id: Option<Uuid>,

    /// Retries already consumed by earlier attempts
    pub retry_count: u32,

    pub max_retries: u32,

    /// Worker slot holding the claim
    pub worker_id: String,

    /// Phase/progress persisted by a previous attempt
    ///
    /// Informational: the executor restarts from the beginning and may use
    /// this to skip work it knows is already done.
    checkpoint: Option<Checkpoint>,

    progress_tx: Option<mpsc::Sender<ProgressUpdate>>,

    cancelled: Arc<AtomicBool>,
}

impl JobContext {
    pub fn new(job_id: Uuid, worker_id: impl Into<String>) -> Self {
        Self {
            job_id,
            batch_id: None,
            retry_count: 0,
            max_retries: 0,
            worker_id: worker_id.into(),
            checkpoint: None,
            progress_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context for a job just claimed from the store
    pub fn for_claim(job: &ClaimedJob) -> Self {
        Self {
            job_id: job.id,
            batch_id: job.batch_id,
            retry_count: job.retry_count,
            max_retries: job.max_retries,
            worker_id: job.worker_id.clone(),
            checkpoint: job.checkpoint.clone(),
            progress_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Route progress reports into `tx`
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Get a handle that can be used to cancel this job
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Whether a failure on this attempt will be permanent
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count.saturating_add(1) >= self.max_retries
    }

    /// Report the current phase and percentage
    ///
    /// # Errors
    ///
    /// Returns an error if cancellation was requested or the progress channel
    /// is closed.
    pub async fn report_progress(
        &self,
        phase: impl Into<String>,
        percent: u8,
    ) -> Result<(), ProgressError> {
        self.send(ProgressUpdate::new(phase, percent)).await
    }

    /// Prove liveness without changing phase or progress
    pub async fn heartbeat(&self) -> Result<(), ProgressError> {
        self.send(ProgressUpdate::default()).await
    }

    async fn send(&self, update: ProgressUpdate) -> Result<(), ProgressError> {
        if self.is_cancelled() {
            return Err(ProgressError::Cancelled);
        }

        if let Some(tx) = &self.progress_tx {
            tx.send(update)
                .await
                .map_err(|_| ProgressError::ChannelClosed)?;
        }

        Ok(())
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Get a future that resolves when cancellation is requested
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = summarize(articles) => { ... }
    ///     _ = ctx.cancelled() => return Err(TaskError::cancelled()),
    /// }
    /// ```
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

/// Handle to cancel a running job
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
