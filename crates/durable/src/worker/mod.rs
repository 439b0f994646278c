//! Worker pool for job execution
//!
//! This module provides:
//! - [`WorkerPool`] - fixed number of slots, each claiming and running one job at a time
//! - [`JobPoller`] - per-slot claim loop with exponential backoff and wake-ups
//! - [`ClaimGate`] - closed by freeze recovery so no slot claims again
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                           │
//! │   slot 0            slot 1            ...   slot N-1        │
//! │  ┌──────────┐      ┌──────────┐            ┌──────────┐     │
//! │  │ breaker? │      │ breaker? │            │ breaker? │     │
//! │  │ claim    │      │ claim    │            │ claim    │     │
//! │  │ execute ─┼─►heartbeat/progress─► JobStore            │     │
//! │  │ finalize │      │ finalize │            │ finalize │     │
//! │  └──────────┘      └──────────┘            └──────────┘     │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each slot creates a fresh executor per job through the
//! [`ExecutorFactory`](crate::task::ExecutorFactory) and drops it when the job
//! ends.

mod gate;
mod poller;
mod pool;

pub use gate::{ClaimGate, ClaimPermit};
pub use poller::{JobPoller, PollerConfig, PollerError, WaitOutcome};
pub use pool::{ActiveJob, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
