//! Stock digest worker process
//!
//! Wires the job engine to PostgreSQL, the digest executor, telemetry and the
//! admin HTTP API. The binary in `main.rs` is a thin shell around [`app`].

pub mod config;
pub mod digest;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use stockdigest_durable::admin::{self, AdminState, ApiDoc};
use stockdigest_durable::{ExecutorFactory, JobEngine, TaskExecutor};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use config::WorkerConfig;
pub use digest::DigestExecutor;
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};

/// Factory handing every claimed job a fresh [`DigestExecutor`]
pub fn digest_factory() -> Arc<dyn ExecutorFactory> {
    Arc::new(|_slot: usize| Box::new(DigestExecutor) as Box<dyn TaskExecutor>)
}

/// Admin router with request tracing and optional Swagger UI
pub fn app(engine: Arc<JobEngine>, enable_swagger: bool) -> Router {
    let mut app = admin::routes(AdminState::new(engine));
    if enable_swagger {
        app = app.merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()));
    }
    app.layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use stockdigest_durable::{EngineConfig, InMemoryJobStore};
    use tower::ServiceExt;

    fn engine() -> Arc<JobEngine> {
        Arc::new(JobEngine::new(
            Arc::new(InMemoryJobStore::new()),
            digest_factory(),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_openapi_served_when_swagger_enabled() {
        let response = app(engine(), true)
            .oneshot(
                Request::builder()
                    .uri("/api-doc/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_swagger_can_be_disabled() {
        let app = app(engine(), false);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api-doc/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
