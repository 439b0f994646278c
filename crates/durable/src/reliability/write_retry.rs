//! Deadlock-aware write wrapper
//!
//! Concurrent workers writing to shared indexes can deadlock each other even
//! when they touch unrelated resource keys. PostgreSQL resolves this by
//! aborting one side, so the aborted write is simply run again after a short
//! pause. [`retry_on_conflict`] does that for any async operation, given a
//! classifier that recognizes the conflict errors and a backoff policy.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::persistence::StoreError;

/// Backoff policy for conflicting writes
///
/// Delays start at `initial_backoff` and double up to `max_backoff`. After
/// `max_attempts` conflicting attempts the last error is raised to the caller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WriteRetryPolicy {
    /// Delay after the first conflict
    #[serde(with = "crate::duration_millis")]
    pub initial_backoff: Duration,

    /// Delay cap
    #[serde(with = "crate::duration_millis")]
    pub max_backoff: Duration,

    /// Hard ceiling on attempts, including the first
    pub max_attempts: u32,

    /// Jitter factor (0.0-1.0) applied to each delay
    pub jitter: f64,
}

impl Default for WriteRetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_attempts: 100,
            jitter: 0.1,
        }
    }
}

impl WriteRetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, conflicts surface immediately
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is the number of
    /// conflicting attempts so far (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let base = self.initial_backoff.as_secs_f64() * 2f64.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Decides whether an error is a retryable write conflict
pub trait ConflictClassifier<E>: Send + Sync {
    fn is_conflict(&self, error: &E) -> bool;
}

impl<E, F> ConflictClassifier<E> for F
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn is_conflict(&self, error: &E) -> bool {
        self(error)
    }
}

/// Classifier for store errors: deadlocks, serialization failures and lock
/// timeouts all surface as [`StoreError::Conflict`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreConflicts;

impl ConflictClassifier<StoreError> for StoreConflicts {
    fn is_conflict(&self, error: &StoreError) -> bool {
        error.is_conflict()
    }
}

/// Error from [`retry_on_conflict`]
#[derive(Debug, thiserror::Error)]
pub enum WriteRetryError<E> {
    /// Every attempt conflicted
    #[error("{operation} still conflicting after {attempts} attempts")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: E,
    },

    /// A non-conflict error, returned as-is
    #[error(transparent)]
    Failed(E),
}

impl<E> WriteRetryError<E> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The underlying error, whichever way the retry ended
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Failed(e) => e,
        }
    }
}

impl From<WriteRetryError<StoreError>> for StoreError {
    fn from(err: WriteRetryError<StoreError>) -> Self {
        match err {
            WriteRetryError::Exhausted {
                operation,
                attempts,
                last,
            } => StoreError::WriteRetriesExhausted {
                operation,
                attempts,
                last: Box::new(last),
            },
            WriteRetryError::Failed(e) => e,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or conflicts
/// `policy.max_attempts` times
pub async fn retry_on_conflict<T, E, C, F, Fut>(
    operation: &'static str,
    policy: &WriteRetryPolicy,
    classifier: &C,
    mut op: F,
) -> Result<T, WriteRetryError<E>>
where
    C: ConflictClassifier<E> + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "write succeeded after conflicts");
                }
                return Ok(value);
            }
            Err(e) if classifier.is_conflict(&e) => {
                if attempt >= max_attempts {
                    return Err(WriteRetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "write conflict, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(WriteRetryError::Failed(e)),
        }
    }
}
