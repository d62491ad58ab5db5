//! Tracing subscriber setup with optional OTLP export.

use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    runtime,
    trace::{Config as TraceConfig, Sampler},
    Resource,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::TelemetryConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error(
        "No OTLP endpoint configured. Set OTEL_EXPORTER_OTLP_ENDPOINT or telemetry.otlp_endpoint"
    )]
    NoEndpoint,
    #[error("Failed to initialize telemetry: {0}")]
    Init(String),
}

fn json_logs() -> bool {
    std::env::var("ELDERCARE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn sampler(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

/// Install the global subscriber.
///
/// Console output is pretty unless `ELDERCARE_LOG_FORMAT=json`. With
/// telemetry enabled, spans are also batched to the OTLP endpoint and console
/// output is always JSON.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if !config.enabled {
        let result = if json_logs() {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .try_init()
        };
        return result.map_err(|e| TelemetryError::Init(e.to_string()));
    }

    let otlp_endpoint = config
        .get_otlp_endpoint()
        .ok_or(TelemetryError::NoEndpoint)?;

    let resource = Resource::new(vec![
        opentelemetry::KeyValue::new("service.name", config.service_name.clone()),
        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&otlp_endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(
            TraceConfig::default()
                .with_sampler(sampler(config.sample_rate))
                .with_resource(resource),
        )
        .install_batch(runtime::Tokio)
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()
        .map_err(|e| TelemetryError::Init(e.to_string()))?;

    tracing::info!(endpoint = %otlp_endpoint, "OpenTelemetry tracing initialized");

    Ok(())
}

/// Flush pending spans before exit.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
