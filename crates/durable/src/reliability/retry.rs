//! Retry manager
//!
//! Decides what happens to a job after a processing timeout or a retryable
//! executor failure. Both stores call [`RetryDecision::after_failure`] so the
//! policy lives in exactly one place.

use serde::{Deserialize, Serialize};

/// Default bound on automatic retries per job
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job-level retry configuration
///
/// # Example
///
/// ```
/// use stockdigest_durable::RetryPolicy;
///
/// let policy = RetryPolicy::default().with_max_retries(5);
/// assert_eq!(policy.max_retries, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry bound stamped on jobs that do not carry their own
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self { max_retries: 0 }
    }

    /// Set the retry bound
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// What to do with a job after a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back in the queue with the new counter
    Requeue { retry_count: u32 },

    /// Counter reached the bound; fail permanently
    Exhausted { retry_count: u32 },
}

impl RetryDecision {
    /// Increment the counter and compare it against the bound
    ///
    /// The counter never exceeds `max_retries`.
    pub fn after_failure(retry_count: u32, max_retries: u32) -> Self {
        let next = retry_count.saturating_add(1);
        if next < max_retries {
            Self::Requeue { retry_count: next }
        } else {
            Self::Exhausted {
                retry_count: next.min(max_retries),
            }
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            Self::Requeue { retry_count } | Self::Exhausted { retry_count } => *retry_count,
        }
    }

    pub fn is_requeue(&self) -> bool {
        matches!(self, Self::Requeue { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        assert_eq!(RetryPolicy::default().max_retries, 3);
        assert_eq!(RetryPolicy::no_retry().max_retries, 0);
    }

    #[test]
    fn test_requeues_below_bound() {
        assert_eq!(
            RetryDecision::after_failure(0, 3),
            RetryDecision::Requeue { retry_count: 1 }
        );
        assert_eq!(
            RetryDecision::after_failure(1, 3),
            RetryDecision::Requeue { retry_count: 2 }
        );
    }

    #[test]
    fn test_exhausts_at_bound() {
        assert_eq!(
            RetryDecision::after_failure(2, 3),
            RetryDecision::Exhausted { retry_count: 3 }
        );
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let decision = RetryDecision::after_failure(0, 0);
        assert!(!decision.is_requeue());
        assert_eq!(decision.retry_count(), 0);
    }

    #[test]
    fn test_counter_never_exceeds_bound() {
        let decision = RetryDecision::after_failure(3, 3);
        assert_eq!(decision, RetryDecision::Exhausted { retry_count: 3 });
    }
}
