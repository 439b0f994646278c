//! Reliability patterns for the job engine
//!
//! This module provides:
//! - [`RetryPolicy`] / [`RetryDecision`] - bounded job-level retry
//! - [`SystemCircuitBreaker`] - store-backed gate in front of claims
//! - [`retry_on_conflict`] - deadlock-aware wrapper around store writes

mod circuit_breaker;
mod retry;
mod write_retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerError, CircuitState, SystemCircuitBreaker,
};
pub use retry::{RetryDecision, RetryPolicy, DEFAULT_MAX_RETRIES};
pub use write_retry::{
    retry_on_conflict, ConflictClassifier, StoreConflicts, WriteRetryError, WriteRetryPolicy,
};
