//! Task executor contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::JobContext;

/// How a task failure is treated by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The task rejected its own input; permanent, not retried, not counted
    /// by the circuit breaker
    Business,

    /// Infrastructure trouble (rate limits, upstream outages, timeouts);
    /// retried up to the job's bound and counted by the circuit breaker
    Infrastructure,

    /// The task stopped because cancellation was requested
    Cancelled,
}

/// Error type for task failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub kind: TaskErrorKind,

    /// Human-readable message stored as `error_message`
    pub message: String,

    /// Full detail (stack trace equivalent) stored as `error_detail`
    pub detail: Option<String>,
}

/// HTTP statuses treated as transient
const TRANSIENT_HTTP_STATUSES: [u16; 3] = [429, 500, 503];

impl TaskError {
    /// Permanent failure
    pub fn business(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Business,
            message: message.into(),
            detail: None,
        }
    }

    /// Transient, retryable failure
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Infrastructure,
            message: message.into(),
            detail: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: "cancelled".to_string(),
            detail: None,
        }
    }

    /// Classify a failure from its message and optional HTTP status
    ///
    /// Rate limiting and server errors (429, 500, 503), timeouts and
    /// connection errors are transient; everything else is a business failure.
    ///
    /// ```
    /// use stockdigest_durable::{TaskError, TaskErrorKind};
    ///
    /// assert_eq!(TaskError::classify("rate limited", Some(429)).kind, TaskErrorKind::Infrastructure);
    /// assert_eq!(TaskError::classify("Read timeout after 30s", None).kind, TaskErrorKind::Infrastructure);
    /// assert_eq!(TaskError::classify("no articles found", None).kind, TaskErrorKind::Business);
    /// ```
    pub fn classify(message: impl Into<String>, http_status: Option<u16>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        let transient = http_status.is_some_and(|s| TRANSIENT_HTTP_STATUSES.contains(&s))
            || lowered.contains("timeout")
            || lowered.contains("timed out")
            || lowered.contains("connection");

        if transient {
            Self::infrastructure(message)
        } else {
            Self::business(message)
        }
    }

    /// Attach the full error detail
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Whether the retry manager may requeue the job
    pub fn is_retryable(&self) -> bool {
        self.kind == TaskErrorKind::Infrastructure
    }

    /// Whether this failure feeds the circuit breaker
    pub fn is_system_level(&self) -> bool {
        self.kind == TaskErrorKind::Infrastructure
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::classify(format!("{:#}", err), None).with_detail(format!("{:?}", err))
    }
}

/// The business task run for each claimed job
///
/// Executors own their external resources (HTTP clients, API sessions).
/// A fresh executor is created for every claimed job and dropped when the
/// job ends, so nothing is shared across worker slots.
///
/// # Example
///
/// ```ignore
/// struct DigestExecutor { http: reqwest::Client }
///
/// #[async_trait]
/// impl TaskExecutor for DigestExecutor {
///     async fn execute(
///         &self,
///         ctx: &JobContext,
///         resource_key: &str,
///         payload: serde_json::Value,
///     ) -> Result<serde_json::Value, TaskError> {
///         ctx.report_progress("ingest", 10).await?;
///         // ...
///         ctx.report_progress("email", 90).await?;
///         Ok(json!({ "ticker": resource_key }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task body
    ///
    /// Return `TaskError::infrastructure()` for transient failures that should
    /// be retried and `TaskError::business()` for permanent ones.
    async fn execute(
        &self,
        ctx: &JobContext,
        resource_key: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError>;

    /// Release per-job resources; called once after `execute` returns
    async fn teardown(&self) {}
}

/// Creates a fresh [`TaskExecutor`] per claimed job
pub trait ExecutorFactory: Send + Sync + 'static {
    /// `slot` identifies the worker slot that will run the executor
    fn create(&self, slot: usize) -> Result<Box<dyn TaskExecutor>, TaskError>;
}

impl<F> ExecutorFactory for F
where
    F: Fn(usize) -> Box<dyn TaskExecutor> + Send + Sync + 'static,
{
    fn create(&self, slot: usize) -> Result<Box<dyn TaskExecutor>, TaskError> {
        Ok(self(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_statuses() {
        for status in [429, 500, 503] {
            let err = TaskError::classify("upstream error", Some(status));
            assert!(err.is_retryable(), "status {} should be transient", status);
        }
        let err = TaskError::classify("not found", Some(404));
        assert_eq!(err.kind, TaskErrorKind::Business);
    }

    #[test]
    fn test_classify_messages() {
        assert!(TaskError::classify("Connection reset by peer", None).is_retryable());
        assert!(TaskError::classify("request timed out", None).is_retryable());
        assert!(!TaskError::classify("invalid ticker symbol", None).is_retryable());
    }

    #[test]
    fn test_cancelled_is_neither_retryable_nor_system() {
        let err = TaskError::cancelled();
        assert!(!err.is_retryable());
        assert!(!err.is_system_level());
    }

    #[test]
    fn test_from_anyhow_keeps_detail() {
        let err: TaskError = anyhow::anyhow!("connection refused")
            .context("fetching filings")
            .into();
        assert_eq!(err.kind, TaskErrorKind::Infrastructure);
        assert_eq!(err.message, "fetching filings: connection refused");
        assert!(err.detail.unwrap().contains("connection refused"));
    }

    #[test]
    fn test_error_serialization() {
        let err = TaskError::business("bad payload").with_detail("missing ticker");
        let json = serde_json::to_string(&err).unwrap();
        let parsed: TaskError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, parsed);
    }

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        async fn execute(
            &self,
            _ctx: &JobContext,
            resource_key: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value, TaskError> {
            Ok(serde_json::json!({ "ticker": resource_key }))
        }
    }

    #[test]
    fn test_closure_factory() {
        let factory = |_slot: usize| Box::new(Noop) as Box<dyn TaskExecutor>;
        assert!(factory.create(0).is_ok());
    }
}
