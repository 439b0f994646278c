// Digest pipeline executor
//
// Stand-in for the feed ingestion / analysis / email rendering modules: walks
// the same phases, reports progress after each, and honours cancellation.
// Payload knobs let operators rehearse failure handling end to end.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use stockdigest_durable::{JobContext, TaskError, TaskExecutor};

/// Pipeline phases with the progress reached when each completes
pub const PHASES: [(&str, u8); 4] = [
    ("ingest", 30),
    ("analysis", 70),
    ("render", 90),
    ("deliver", 100),
];

/// Optional knobs in the job payload
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DigestPayload {
    /// Simulated work per phase
    pub phase_delay_ms: u64,
    pub simulate_failure: Option<SimulatedFailure>,
}

/// Fail when reaching `phase`, classified like a real upstream error
#[derive(Debug, Deserialize)]
pub struct SimulatedFailure {
    pub phase: String,
    pub message: String,
    pub http_status: Option<u16>,
}

#[derive(Debug, Default)]
pub struct DigestExecutor;

#[async_trait]
impl TaskExecutor for DigestExecutor {
    async fn execute(
        &self,
        ctx: &JobContext,
        ticker: &str,
        payload: Value,
    ) -> Result<Value, TaskError> {
        let payload: DigestPayload = serde_json::from_value(payload)
            .map_err(|e| TaskError::business(format!("invalid payload: {}", e)))?;

        let resumed_from = ctx.checkpoint().map(|c| c.phase.clone());
        if let Some(phase) = &resumed_from {
            tracing::info!(job_id = %ctx.job_id, ticker, phase = %phase, "previous attempt stopped here");
        }

        let delay = Duration::from_millis(payload.phase_delay_ms);
        for (phase, progress) in PHASES {
            if let Some(failure) = &payload.simulate_failure {
                if failure.phase == phase {
                    return Err(TaskError::classify(&failure.message, failure.http_status)
                        .with_detail(format!("{} failed for {}", phase, ticker)));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => return Err(TaskError::cancelled()),
            }
            ctx.report_progress(phase, progress).await?;
        }

        Ok(json!({
            "ticker": ticker,
            "attempt": ctx.retry_count + 1,
            "resumed_from": resumed_from,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockdigest_durable::TaskErrorKind;
    use uuid::Uuid;

    fn ctx() -> JobContext {
        JobContext::new(Uuid::now_v7(), "test-slot-0")
    }

    #[tokio::test]
    async fn test_runs_all_phases() {
        let result = DigestExecutor
            .execute(&ctx(), "AAPL", json!({}))
            .await
            .unwrap();
        assert_eq!(result["ticker"], "AAPL");
        assert_eq!(result["attempt"], 1);
        assert!(result["resumed_from"].is_null());
    }

    #[tokio::test]
    async fn test_simulated_rate_limit_is_transient() {
        let err = DigestExecutor
            .execute(
                &ctx(),
                "AAPL",
                json!({
                    "simulate_failure": {
                        "phase": "analysis",
                        "message": "rate limited",
                        "http_status": 429
                    }
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Infrastructure);
        assert_eq!(err.detail.as_deref(), Some("analysis failed for AAPL"));
    }

    #[tokio::test]
    async fn test_bad_payload_is_business_failure() {
        let err = DigestExecutor
            .execute(&ctx(), "AAPL", json!({ "phase_delay_ms": "slow" }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Business);
    }

    #[tokio::test]
    async fn test_cancellation_stops_pipeline() {
        let ctx = ctx();
        ctx.cancellation_handle().cancel();
        let err = DigestExecutor
            .execute(&ctx, "AAPL", json!({ "phase_delay_ms": 60000 }))
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::Cancelled);
    }
}
