// Tracing and OpenTelemetry setup for the worker process

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_SERVICE_NAME: &str = "stockdigest-worker";

/// Configuration for OpenTelemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for traces
    pub service_name: String,
    pub service_version: Option<String>,
    /// OTLP endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: Option<String>,
    /// Deployment environment (e.g., "production")
    pub environment: Option<String>,
    pub enable_console: bool,
    /// Log filter (e.g., "info", "stockdigest_durable=debug")
    pub log_filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            otlp_endpoint: None,
            environment: None,
            enable_console: true,
            log_filter: None,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: "stockdigest-worker")
    /// - `OTEL_SERVICE_VERSION`: Service version
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint
    /// - `OTEL_ENVIRONMENT`: Deployment environment
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            service_name: non_empty("OTEL_SERVICE_NAME")
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            service_version: non_empty("OTEL_SERVICE_VERSION"),
            otlp_endpoint: non_empty("OTEL_EXPORTER_OTLP_ENDPOINT"),
            environment: non_empty("OTEL_ENVIRONMENT"),
            enable_console: true,
            log_filter: non_empty("RUST_LOG").or_else(|| non_empty("LOG_LEVEL")),
        }
    }
}

/// Guard that shuts down the tracer provider when dropped
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Failed to shutdown tracer provider: {:?}", e);
            }
        }
    }
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the lifetime of the process; spans are
/// flushed when it drops.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter = config
        .log_filter
        .as_deref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let console_layer = config.enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
    });

    let exporter = config
        .otlp_endpoint
        .as_deref()
        .map(|endpoint| (endpoint, build_provider(endpoint, resource(&config))));

    let (provider, otel_layer) = match &exporter {
        Some((_, Ok(provider))) => {
            let tracer = provider.tracer(DEFAULT_SERVICE_NAME);
            (
                Some(provider.clone()),
                Some(tracing_opentelemetry::layer().with_tracer(tracer)),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(otel_layer)
        .init();

    match exporter {
        Some((endpoint, Ok(_))) => tracing::info!(endpoint, "OpenTelemetry tracing enabled"),
        Some((endpoint, Err(e))) => tracing::warn!(
            endpoint,
            error = %e,
            "OTLP exporter unavailable, continuing with console logging only"
        ),
        None => tracing::debug!("OTEL_EXPORTER_OTLP_ENDPOINT not set, tracing export disabled"),
    }

    TelemetryGuard { provider }
}

fn resource(config: &TelemetryConfig) -> Resource {
    let optional = [
        ("service.version", config.service_version.as_ref()),
        ("deployment.environment", config.environment.as_ref()),
    ];
    let attributes = std::iter::once(KeyValue::new("service.name", config.service_name.clone()))
        .chain(
            optional
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| KeyValue::new(key, v.clone()))),
        );
    Resource::builder().with_attributes(attributes).build()
}

fn build_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkTracerProvider, opentelemetry::trace::TraceError> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_without_env() {
        let config = TelemetryConfig::from_lookup(|_| None);
        assert_eq!(config, TelemetryConfig::default());
        assert_eq!(config.service_name, "stockdigest-worker");
    }

    #[test]
    fn test_rust_log_wins_over_log_level() {
        let vars: HashMap<&str, &str> = [
            ("OTEL_SERVICE_NAME", "digest-eu"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel:4317"),
            ("RUST_LOG", "stockdigest_durable=debug"),
            ("LOG_LEVEL", "warn"),
        ]
        .into_iter()
        .collect();
        let config = TelemetryConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.service_name, "digest-eu");
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://otel:4317"));
        assert_eq!(config.log_filter.as_deref(), Some("stockdigest_durable=debug"));
    }
}
