//! Diagnostics for jobtrail itself: `tracing` output plus optional OTLP
//! export of traces, metrics and logs.
//!
//! Lifecycle events do not travel through here; they go to publishers. All
//! human-readable output goes to stderr so stdout stays free for event
//! streams.

pub mod job;
pub mod metrics;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::Config;
use crate::error::{Error, Result};

/// Instrumentation scope name used for the tracer.
const SCOPE: &str = "jobtrail";

pub struct TelemetryConfig {
    /// OTLP collector (e.g. "http://localhost:4317"). `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Filter directive used when `RUST_LOG` is unset (e.g. "info").
    pub log_level: String,
}

impl TelemetryConfig {
    /// Telemetry settings for a binary named `service_name`.
    pub fn from_config(config: &Config, service_name: impl Into<String>) -> Self {
        Self {
            endpoint: config.otel_endpoint.clone(),
            service_name: service_name.into(),
            log_level: config.log_level.clone(),
        }
    }
}

/// The three OTLP pipelines, present only when an endpoint is configured.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

/// Keeps the exporters alive; flushes and shuts them down on drop.
///
/// Hold it for as long as the process should report telemetry.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    /// Push buffered spans, metrics and logs to the collector now.
    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            let _ = exporters.tracer.force_flush();
            let _ = exporters.meter.force_flush();
            let _ = exporters.logger.force_flush();
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        // Logs first, so shutdown messages from the other providers are not lost.
        if let Some(exporters) = self.exporters.take() {
            let _ = exporters.logger.shutdown();
            let _ = exporters.meter.shutdown();
            let _ = exporters.tracer.shutdown();
        }
    }
}

/// Install the global `tracing` subscriber, exporting over OTLP when
/// `config.endpoint` is set.
///
/// # Errors
///
/// Fails when an exporter cannot be built or a global subscriber is
/// already installed.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let Some(endpoint) = config.endpoint.as_deref() else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
            .map_err(subscriber_error)?;
        return Ok(TelemetryGuard { exporters: None });
    };

    let exporters = build_exporters(endpoint, resource(config.service_name))?;
    opentelemetry::global::set_meter_provider(exporters.meter.clone());

    let traces = tracing_opentelemetry::layer().with_tracer(exporters.tracer.tracer(SCOPE));
    let logs =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&exporters.logger);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(traces)
        .with(logs)
        .try_init()
        .map_err(subscriber_error)?;

    tracing::debug!(endpoint, "OTLP export enabled");
    Ok(TelemetryGuard {
        exporters: Some(exporters),
    })
}

fn resource(service_name: String) -> Resource {
    Resource::builder()
        .with_service_name(service_name)
        .with_attribute(KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ))
        .build()
}

fn build_exporters(endpoint: &str, resource: Resource) -> Result<Exporters> {
    let spans = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("span", e))?;
    let metrics = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("metric", e))?;
    let logs = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| exporter_error("log", e))?;

    Ok(Exporters {
        tracer: SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build(),
        meter: SdkMeterProvider::builder()
            .with_periodic_exporter(metrics)
            .with_resource(resource.clone())
            .build(),
        logger: SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build(),
    })
}

fn exporter_error(signal: &str, e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn subscriber_error(e: impl std::fmt::Display) -> Error {
    Error::Other(format!("failed to init tracing subscriber: {e}"))
}
