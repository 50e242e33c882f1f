//! Logging and OpenTelemetry tracing
//!
//! Console logs are always on (plain text, or JSON lines for log shippers).
//! Spans are additionally exported over OTLP when an endpoint is configured:
//!
//! ```text
//! agentjobs → OTLP (gRPC) → OTel Collector → Tempo (traces)
//!     └──── stdout (fmt | json) ───────────→ Loki (logs)
//! ```

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,agentjobs=debug";

/// Telemetry settings (`telemetry` config section).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`; no export when unset
    pub otlp_endpoint: Option<String>,
    /// Emit logs as JSON lines instead of human-readable text
    pub json_logs: bool,
}

/// Initialize the tracing subsystem
///
/// This sets up:
/// - an `EnvFilter` from `RUST_LOG` (default `info,agentjobs=debug`)
/// - console logging, plain or JSON
/// - OpenTelemetry span export when `config.otlp_endpoint` is set
///
/// # Arguments
/// * `service_name` - Name for the service in traces
/// * `config` - Telemetry section of the service config
pub fn init_tracing(
    service_name: &str,
    config: &TelemetryConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let tracer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.clone());
            Some(
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_exporter(exporter)
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![
                            KeyValue::new("service.name", service_name.to_string()),
                            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                        ],
                    )))
                    .install_batch(runtime::Tokio)?,
            )
        }
        None => None,
    };
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    let (plain_layer, json_layer) = if config.json_logs {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(plain_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    tracing::info!(
        service = service_name,
        otlp_endpoint = config.otlp_endpoint.as_deref().unwrap_or("disabled"),
        json_logs = config.json_logs,
        "tracing initialized"
    );

    Ok(())
}

/// Shutdown the tracing subsystem gracefully
///
/// Flushes any pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("tracing shutdown complete");
}
