//! Task executor contract
//!
//! The engine treats the business work (feed ingestion, AI analysis, email
//! rendering) as an opaque [`TaskExecutor`] that receives a payload and a
//! [`JobContext`] for progress reporting and cancellation.

mod context;
mod executor;

pub use context::{CancellationHandle, JobContext, ProgressError};
pub use executor::{ExecutorFactory, TaskError, TaskErrorKind, TaskExecutor};
