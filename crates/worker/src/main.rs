use std::sync::Arc;

use anyhow::{Context, Result};
use stockdigest_durable::monitor::{ExitSupervisor, ProcessSupervisor};
use stockdigest_durable::persistence::{connect, migrate, PostgresJobStore};
use stockdigest_durable::JobEngine;
use stockdigest_worker::{app, digest_factory, init_telemetry, TelemetryConfig, WorkerConfig};

enum Exit {
    Signal,
    Frozen(String),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via OTEL_SERVICE_NAME, OTEL_EXPORTER_OTLP_ENDPOINT, RUST_LOG or LOG_LEVEL
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("stockdigest_worker=info,stockdigest_durable=info".to_string());
    }
    let telemetry_guard = init_telemetry(telemetry_config);

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_id = %config.engine.pool.worker_id,
        pool_size = config.engine.pool.pool_size,
        max_connections = config.engine.store.max_connections,
        admin = %config.admin_bind_address,
        "stockdigest-worker starting"
    );

    let pool = connect(&config.engine.store)
        .await
        .context("Failed to connect to PostgreSQL")?;
    if config.run_migrations {
        migrate(&pool).await.context("Failed to run migrations")?;
        tracing::info!("Migrations applied");
    }

    let store = Arc::new(PostgresJobStore::new(pool));
    let engine = Arc::new(JobEngine::new(
        store,
        digest_factory(),
        config.engine.clone(),
    ));
    engine.start().context("Failed to start job engine")?;

    let listener = tokio::net::TcpListener::bind(config.admin_bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.admin_bind_address))?;
    tracing::info!(address = %config.admin_bind_address, "Admin API listening");

    let (server_stop_tx, server_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let router = app(engine.clone(), config.enable_swagger);
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                server_stop_rx.await.ok();
            })
            .await
    });

    let exit = tokio::select! {
        reason = engine.run_until_frozen() => Exit::Frozen(reason),
        _ = tokio::signal::ctrl_c() => Exit::Signal,
    };
    server_stop_tx.send(()).ok();

    match exit {
        Exit::Frozen(reason) => {
            // Claims are already back in the queue; skip the drain
            drop(telemetry_guard);
            ExitSupervisor.terminate(&reason);
        }
        Exit::Signal => {
            tracing::info!("Received shutdown signal");
            if let Err(e) = engine.shutdown().await {
                tracing::warn!(error = %e, "Engine did not drain cleanly");
            }
            match server.await {
                Ok(Err(e)) => tracing::warn!(error = %e, "Admin server error"),
                Err(e) => tracing::warn!(error = %e, "Admin server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
