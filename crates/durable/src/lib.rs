//! # Stock Digest Job Engine
//!
//! A PostgreSQL-backed job queue and worker orchestration engine for batches
//! of per-ticker digest jobs.
//!
//! ## Features
//!
//! - **Exactly-once claiming**: `FOR UPDATE SKIP LOCKED` claims, one worker per job
//! - **Resource-key exclusion**: never two processing jobs for the same ticker
//! - **Two-phase timeouts**: queue timeout and heartbeat-based processing timeout
//! - **Bounded retry**: transient failures requeue until `max_retries`, business failures do not
//! - **Freeze detection**: pool-wide heartbeat silence triggers crash-only recovery
//! - **System circuit breaker**: repeated infrastructure failures pause all claims
//! - **Deadlock-aware writes**: conflicting store writes are retried with backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 JobEngine  (+ admin HTTP API)                │
//! │   (submission, status, cancel, breaker reset, lifecycle)    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────┐ ┌──────────────────┐ ┌──────────────────────┐
//! │   WorkerPool    │ │  TimeoutMonitor  │ │    FreezeDetector    │
//! │ (slots claim &  │ │ (queue/heartbeat │ │ (pool-wide silence → │
//! │  run executors) │ │   timeouts)      │ │  FreezeRecovery)     │
//! └─────────────────┘ └──────────────────┘ └──────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        RetryingJobStore → JobStore (PostgreSQL / memory)     │
//! │        (batches, jobs, circuit breaker row)                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use stockdigest_durable::prelude::*;
//!
//! struct DigestExecutor;
//!
//! #[async_trait]
//! impl TaskExecutor for DigestExecutor {
//!     async fn execute(&self, ctx: &JobContext, ticker: &str, payload: Value) -> Result<Value, TaskError> {
//!         ctx.report_progress("ingest", 10).await?;
//!         // ... fetch feeds, analyze, render
//!         ctx.report_progress("render", 90).await?;
//!         Ok(json!({ "ticker": ticker }))
//!     }
//! }
//!
//! let store = Arc::new(PostgresJobStore::new(connect(&config.store).await?));
//! let factory: Arc<dyn ExecutorFactory> =
//!     Arc::new(|_slot: usize| Box::new(DigestExecutor) as Box<dyn TaskExecutor>);
//! let engine = JobEngine::new(store, factory, EngineConfig::from_env());
//! engine.start()?;
//! ```

pub mod admin;
pub mod engine;
pub mod monitor;
pub mod persistence;
pub mod reliability;
pub mod task;
pub mod worker;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{EngineConfig, EngineError, EngineStats, JobEngine};
    pub use crate::monitor::{
        ExitSupervisor, ProcessSupervisor, SignalSupervisor, FREEZE_EXIT_CODE,
    };
    pub use crate::persistence::{
        connect, migrate, BatchDetail, CancelOutcome, InMemoryJobStore, Job, JobStatus, JobStore,
        NewJob, PostgresJobStore, StoreConfig, StoreError,
    };
    pub use crate::reliability::{CircuitBreakerConfig, RetryPolicy, WriteRetryPolicy};
    pub use crate::task::{ExecutorFactory, JobContext, TaskError, TaskErrorKind, TaskExecutor};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
}

// Re-export key types at crate root
pub use engine::{EngineConfig, EngineError, EngineStats, JobEngine};
pub use persistence::{
    InMemoryJobStore, Job, JobStatus, JobStore, NewJob, PostgresJobStore, StoreError,
};
pub use reliability::{CircuitBreakerConfig, RetryPolicy, WriteRetryPolicy};
pub use task::{ExecutorFactory, JobContext, TaskError, TaskErrorKind, TaskExecutor};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
