//! Job engine facade
//!
//! [`JobEngine`] owns the store (wrapped for conflict retries), the circuit
//! breaker, the worker pool and both monitors, and exposes the operations
//! callers and the admin API use.

mod config;
mod job_engine;

pub use config::EngineConfig;
pub use job_engine::{EngineError, EngineStats, JobEngine};
