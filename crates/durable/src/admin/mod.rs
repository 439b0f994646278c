//! Operator HTTP API
//!
//! Thin axum layer over [`JobEngine`](crate::engine::JobEngine): batch
//! submission, status reads, cancellation, breaker reset and purge. Hosts
//! mount [`routes`] and may serve [`ApiDoc`] through Swagger UI.

mod routes;

use utoipa::OpenApi;

pub use routes::{
    routes, AdminState, ErrorResponse, HealthResponse, ListJobsParams, PurgeRequest,
    PurgeResponse, SubmitBatchRequest, SubmitBatchResponse,
};

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health,
        routes::submit_batch,
        routes::get_batch,
        routes::list_jobs,
        routes::get_job,
        routes::cancel_job,
        routes::reset_circuit_breaker,
        routes::stats,
        routes::purge,
    ),
    components(schemas(
        routes::ErrorResponse,
        routes::HealthResponse,
        routes::SubmitBatchRequest,
        routes::SubmitBatchResponse,
        routes::PurgeRequest,
        routes::PurgeResponse,
        crate::persistence::NewJob,
        crate::persistence::Job,
        crate::persistence::JobStatus,
        crate::persistence::BatchDetail,
        crate::persistence::StatusCounts,
        crate::persistence::CancelOutcome,
        crate::persistence::BreakerRecord,
        crate::persistence::QueueStats,
        crate::reliability::CircuitState,
        crate::worker::PoolStats,
        crate::worker::ActiveJob,
        crate::worker::WorkerPoolStatus,
        crate::engine::EngineStats,
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "batches", description = "Batch submission and status"),
        (name = "jobs", description = "Job status and cancellation"),
        (name = "admin", description = "Circuit breaker, statistics and maintenance"),
    ),
    info(
        title = "Stock Digest Job Engine",
        description = "Admin API for the stock digest job queue"
    )
)]
pub struct ApiDoc;
