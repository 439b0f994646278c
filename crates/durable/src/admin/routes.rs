// Admin HTTP routes

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::{EngineError, EngineStats, JobEngine};
use crate::persistence::{
    BatchDetail, BreakerRecord, CancelOutcome, Job, JobFilter, JobStatus, NewJob, Pagination,
    StoreError,
};

/// App state
#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<JobEngine>,
}

impl AdminState {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self { engine }
    }
}

/// Standard error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: EngineError) -> ApiError {
    let status = match &err {
        EngineError::InvalidInput(_) | EngineError::Store(StoreError::InvalidInput(_)) => {
            StatusCode::BAD_REQUEST
        }
        EngineError::Store(StoreError::JobNotFound(_) | StoreError::BatchNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "admin request failed");
    }
    (status, Json(ErrorResponse::new(err.to_string())))
}

/// Request to submit a batch
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitBatchRequest {
    pub jobs: Vec<NewJob>,
    /// Configuration snapshot stored with the batch
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitBatchResponse {
    pub batch_id: Uuid,
    pub jobs: usize,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub resource_key: Option<String>,
    pub batch_id: Option<Uuid>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    100
}

/// Request to purge finished jobs
#[derive(Debug, Deserialize, ToSchema)]
pub struct PurgeRequest {
    /// Delete terminal jobs that finished more than this many seconds ago
    pub older_than_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub deleted: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create admin routes
pub fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/batches", post(submit_batch))
        .route("/v1/batches/:batch_id", get(get_batch))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/:job_id", get(get_job))
        .route("/v1/jobs/:job_id/cancel", post(cancel_job))
        .route("/v1/circuit-breaker/reset", post(reset_circuit_breaker))
        .route("/v1/stats", get(stats))
        .route("/v1/admin/purge", post(purge))
        .with_state(state)
}

/// GET /health - Liveness
///
/// Reports `frozen` once freeze recovery has fired, so a load balancer stops
/// routing to a process that is about to exit.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Engine is running", body = HealthResponse),
        (status = 503, description = "Freeze recovery has fired", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AdminState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, label) = if state.engine.is_frozen() {
        (StatusCode::SERVICE_UNAVAILABLE, "frozen")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

/// POST /v1/batches - Submit a batch of jobs
#[utoipa::path(
    post,
    path = "/v1/batches",
    request_body = SubmitBatchRequest,
    responses(
        (status = 201, description = "Batch persisted and queued", body = SubmitBatchResponse),
        (status = 400, description = "Empty batch or invalid job", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "batches"
)]
pub async fn submit_batch(
    State(state): State<AdminState>,
    Json(req): Json<SubmitBatchRequest>,
) -> Result<(StatusCode, Json<SubmitBatchResponse>), ApiError> {
    let jobs = req.jobs.len();
    let batch_id = state
        .engine
        .submit_batch(req.jobs, req.config)
        .await
        .map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitBatchResponse { batch_id, jobs }),
    ))
}

/// GET /v1/batches/{batch_id} - Batch with its jobs and status counts
#[utoipa::path(
    get,
    path = "/v1/batches/{batch_id}",
    params(("batch_id" = Uuid, Path, description = "Batch ID")),
    responses(
        (status = 200, description = "Batch found", body = BatchDetail),
        (status = 404, description = "Batch not found", body = ErrorResponse)
    ),
    tag = "batches"
)]
pub async fn get_batch(
    State(state): State<AdminState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchDetail>, ApiError> {
    let batch = state.engine.get_batch(batch_id).await.map_err(api_error)?;
    Ok(Json(batch))
}

/// GET /v1/jobs - List jobs
#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("resource_key" = Option<String>, Query, description = "Filter by resource key"),
        ("batch_id" = Option<Uuid>, Query, description = "Filter by batch"),
        ("limit" = Option<u32>, Query, description = "Max number of results (default 100)"),
        ("offset" = Option<u32>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Jobs, oldest first", body = Vec<Job>),
        (status = 400, description = "Unknown status", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AdminState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|_| {
            api_error(EngineError::InvalidInput(format!(
                "unknown status: {}",
                params.status.as_deref().unwrap_or_default()
            )))
        })?;

    let filter = JobFilter {
        status,
        resource_key: params.resource_key,
        batch_id: params.batch_id,
    };
    let pagination = Pagination {
        offset: params.offset,
        limit: params.limit,
    };

    let jobs = state
        .engine
        .list_jobs(filter, pagination)
        .await
        .map_err(api_error)?;
    Ok(Json(jobs))
}

/// GET /v1/jobs/{job_id} - Job status, progress and result
#[utoipa::path(
    get,
    path = "/v1/jobs/{job_id}",
    params(("job_id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job found", body = Job),
        (status = 404, description = "Job not found", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<AdminState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.engine.get_job(job_id).await.map_err(api_error)?;
    Ok(Json(job))
}

/// POST /v1/jobs/{job_id}/cancel - Cancel a job
#[utoipa::path(
    post,
    path = "/v1/jobs/{job_id}/cancel",
    params(("job_id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Cancel outcome", body = CancelOutcome),
        (status = 404, description = "Job not found", body = ErrorResponse)
    ),
    tag = "jobs"
)]
pub async fn cancel_job(
    State(state): State<AdminState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<CancelOutcome>, ApiError> {
    let outcome = state.engine.cancel_job(job_id).await.map_err(api_error)?;
    Ok(Json(outcome))
}

/// POST /v1/circuit-breaker/reset - Force the breaker closed
#[utoipa::path(
    post,
    path = "/v1/circuit-breaker/reset",
    responses(
        (status = 200, description = "Breaker state after reset", body = BreakerRecord),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn reset_circuit_breaker(
    State(state): State<AdminState>,
) -> Result<Json<BreakerRecord>, ApiError> {
    let record = state
        .engine
        .reset_circuit_breaker()
        .await
        .map_err(api_error)?;
    tracing::info!("circuit breaker reset by operator");
    Ok(Json(record))
}

/// GET /v1/stats - Pool, queue and breaker snapshot
#[utoipa::path(
    get,
    path = "/v1/stats",
    responses(
        (status = 200, description = "Engine statistics", body = EngineStats),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn stats(State(state): State<AdminState>) -> Result<Json<EngineStats>, ApiError> {
    let stats = state.engine.stats().await.map_err(api_error)?;
    Ok(Json(stats))
}

/// POST /v1/admin/purge - Delete old terminal jobs
#[utoipa::path(
    post,
    path = "/v1/admin/purge",
    request_body = PurgeRequest,
    responses(
        (status = 200, description = "Number of deleted jobs", body = PurgeResponse),
        (status = 400, description = "Window out of range", body = ErrorResponse)
    ),
    tag = "admin"
)]
pub async fn purge(
    State(state): State<AdminState>,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let deleted = state
        .engine
        .purge_finished(Duration::from_secs(req.older_than_secs))
        .await
        .map_err(api_error)?;
    Ok(Json(PurgeResponse { deleted }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::persistence::InMemoryJobStore;
    use crate::task::{ExecutorFactory, JobContext, TaskError, TaskExecutor};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Noop;

    #[async_trait]
    impl TaskExecutor for Noop {
        async fn execute(&self, _: &JobContext, _: &str, _: Value) -> Result<Value, TaskError> {
            Ok(json!({}))
        }
    }

    /// Engine that is never started, so submitted jobs stay queued
    fn app() -> Router {
        let store = Arc::new(InMemoryJobStore::new());
        let factory: Arc<dyn ExecutorFactory> =
            Arc::new(|_slot: usize| Box::new(Noop) as Box<dyn TaskExecutor>);
        let engine = JobEngine::new(store, factory, EngineConfig::default());
        routes(AdminState::new(Arc::new(engine)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_read_batch() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/v1/batches",
            Some(json!({
                "jobs": [
                    { "resource_key": "AAPL", "payload": { "mode": "daily" } },
                    { "resource_key": "MSFT" }
                ],
                "config": { "recipients": 12 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["jobs"], 2);
        let batch_id = body["batch_id"].as_str().unwrap().to_string();

        let (status, batch) = send(&app, "GET", &format!("/v1/batches/{}", batch_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["config"]["recipients"], 12);
        assert_eq!(batch["counts"]["queued"], 2);
        assert_eq!(batch["jobs"][0]["resource_key"], "AAPL");

        let job_id = batch["jobs"][1]["id"].as_str().unwrap().to_string();
        let (status, job) = send(&app, "GET", &format!("/v1/jobs/{}", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "queued");

        let (status, jobs) = send(&app, "GET", "/v1/jobs?resource_key=MSFT", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jobs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_bad_request() {
        let app = app();
        let (status, body) = send(&app, "POST", "/v1/batches", Some(json!({ "jobs": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("at least one job"));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let app = app();
        let id = Uuid::now_v7();

        let (status, _) = send(&app, "GET", &format!("/v1/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", &format!("/v1/batches/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "POST", &format!("/v1/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_status_filter_is_bad_request() {
        let app = app();
        let (status, _) = send(&app, "GET", "/v1/jobs?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let app = app();
        let (_, body) = send(
            &app,
            "POST",
            "/v1/batches",
            Some(json!({ "jobs": [{ "resource_key": "TSLA" }] })),
        )
        .await;
        let batch_id = body["batch_id"].as_str().unwrap().to_string();
        let (_, batch) = send(&app, "GET", &format!("/v1/batches/{}", batch_id), None).await;
        let job_id = batch["jobs"][0]["id"].as_str().unwrap().to_string();

        let (status, outcome) =
            send(&app, "POST", &format!("/v1/jobs/{}/cancel", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "cancelled");

        let (_, job) = send(&app, "GET", &format!("/v1/jobs/{}", job_id), None).await;
        assert_eq!(job["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_breaker_reset_stats_and_purge() {
        let app = app();

        let (status, record) = send(&app, "POST", "/v1/circuit-breaker/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["state"], "closed");
        assert_eq!(record["consecutive_failures"], 0);

        let (status, stats) = send(&app, "GET", "/v1/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["pool"]["status"], "stopped");
        assert_eq!(stats["breaker"]["state"], "closed");

        let (status, purged) = send(
            &app,
            "POST",
            "/v1/admin/purge",
            Some(json!({ "older_than_secs": 86400 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(purged["deleted"], 0);
    }
}
