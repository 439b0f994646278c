//! Persistence layer for the job engine
//!
//! This module provides:
//! - [`JobStore`] trait for batches, jobs and the circuit breaker row
//! - [`PostgresJobStore`] for production
//! - [`InMemoryJobStore`] for testing
//! - [`RetryingJobStore`] decorator retrying conflicting writes

mod memory;
mod postgres;
mod retrying;
mod store;

pub use memory::{FaultKind, InMemoryJobStore};
pub use postgres::{classify_sqlx_error, connect, migrate, PostgresJobStore, StoreConfig};
pub use retrying::RetryingJobStore;
pub use store::{
    BatchDetail, BreakerRecord, CancelOutcome, Checkpoint, ClaimedJob, FailureOutcome,
    FreezeProbe, HeartbeatResponse, Job, JobFailure, JobFilter, JobStatus, JobStore, NewJob,
    Pagination, ProgressUpdate, QueueStats, StatusCounts, StoreError, SweepReport, TimeoutSweep,
};
