// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const SERVICE_NAME: &str = "llm-batch";

/// Initialize structured logging with JSON formatting and trace context
///
/// Log levels come from `RUST_LOG` when set, otherwise from configuration.
/// When an OTLP endpoint is configured, spans are also exported there.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");
    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider, flushing remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize the Prometheus metrics exporter and describe all metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "batch_jobs_completed_total",
        "Total number of batch jobs completed"
    );
    describe_counter!("batch_jobs_failed_total", "Total number of batch jobs failed");
    describe_counter!(
        "batch_jobs_cancelled_total",
        "Total number of batch jobs cancelled by users"
    );
    describe_counter!(
        "batch_requests_processed_total",
        "Total number of requests with results on disk"
    );
    describe_histogram!(
        "batch_chunk_inference_seconds",
        "Inference wall time per chunk in seconds"
    );
    describe_gauge!(
        "batch_queue_depth",
        "Jobs currently in validating, in_progress, or finalizing"
    );
    describe_counter!(
        "webhook_delivered_total",
        "Webhook notifications delivered successfully"
    );
    describe_counter!(
        "webhook_dead_lettered_total",
        "Webhook notifications moved to the dead letter queue"
    );

    tracing::info!(metrics_port = metrics_port, "Prometheus metrics exporter initialized");
    Ok(())
}

#[inline]
pub fn record_job_completed(batch_id: &str, model: &str) {
    counter!(
        "batch_jobs_completed_total",
        "batch_id" => batch_id.to_string(),
        "model" => model.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_failed(batch_id: &str, model: &str, reason: &str) {
    counter!(
        "batch_jobs_failed_total",
        "batch_id" => batch_id.to_string(),
        "model" => model.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_job_cancelled(batch_id: &str) {
    counter!("batch_jobs_cancelled_total", "batch_id" => batch_id.to_string()).increment(1);
}

#[inline]
pub fn record_chunk(batch_id: &str, requests: usize, inference_seconds: f64) {
    counter!("batch_requests_processed_total", "batch_id" => batch_id.to_string())
        .increment(requests as u64);
    histogram!("batch_chunk_inference_seconds", "batch_id" => batch_id.to_string())
        .record(inference_seconds);
}

#[inline]
pub fn update_queue_depth(depth: i64) {
    gauge!("batch_queue_depth").set(depth as f64);
}

#[inline]
pub fn record_webhook_delivered(batch_id: &str) {
    counter!("webhook_delivered_total", "batch_id" => batch_id.to_string()).increment(1);
}

#[inline]
pub fn record_webhook_dead_lettered(batch_id: &str) {
    counter!("webhook_dead_lettered_total", "batch_id" => batch_id.to_string()).increment(1);
}
