// Telemetry: structured logging, metrics and tracing

use crate::models::{RunOutcome, RunSummary};
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

const SERVICE_NAME: &str = "tax-bot";

/// Install the global subscriber: JSON lines on stderr, filtered by
/// `RUST_LOG` or else `log_level`, plus an OTLP span exporter when
/// `tracing_endpoint` is set.
///
/// stdout is left to command output (`once`, `stats`).
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Invalid log level '{}': {}", log_level, e))?;

    let json = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_filter(filter);

    let otel = tracing_endpoint
        .map(init_tracer)
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    tracing_subscriber::registry()
        .with(json)
        .with(otel)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Logging already initialized: {}", e))?;

    tracing::info!(
        log_level,
        tracing_endpoint = tracing_endpoint.unwrap_or("disabled"),
        "Logging ready"
    );
    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Cannot export spans to {}: {}", endpoint, e))?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);
    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider.tracer(SERVICE_NAME))
}

/// Flush remaining spans; call on shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Serve `/metrics` for Prometheus on `port` and register the run metrics
pub fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Cannot serve metrics on {}: {}", addr, e))?;

    describe_counter!("taxbot_runs_total", "Runs by outcome");
    describe_counter!(
        "taxbot_obligations_notified_total",
        "Obligations delivered and committed"
    );
    describe_counter!(
        "taxbot_obligation_failures_total",
        "Per-obligation failures by stage"
    );
    describe_histogram!("taxbot_run_duration_seconds", "Wall time of a run");
    describe_gauge!(
        "taxbot_pending_obligations",
        "Actionable obligations not yet handled at the end of the last run"
    );

    tracing::info!(%addr, "Metrics exporter listening");
    Ok(())
}

/// Which step of the pipeline an obligation failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Evaluation,
    Transient,
    Permanent,
    Commit,
}

impl FailureStage {
    fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Evaluation => "evaluation",
            FailureStage::Transient => "transient",
            FailureStage::Permanent => "permanent",
            FailureStage::Commit => "commit",
        }
    }
}

#[inline]
pub fn record_run(outcome: RunOutcome, duration_seconds: f64) {
    counter!("taxbot_runs_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("taxbot_run_duration_seconds").record(duration_seconds);
}

#[inline]
pub fn record_notified(kind: &str) {
    counter!("taxbot_obligations_notified_total", "kind" => kind.to_string()).increment(1);
}

#[inline]
pub fn record_failure(stage: FailureStage) {
    counter!("taxbot_obligation_failures_total", "stage" => stage.as_str()).increment(1);
}

#[inline]
pub fn update_pending(count: usize) {
    gauge!("taxbot_pending_obligations").set(count as f64);
}

/// Alert hook for runs that need an operator
#[async_trait::async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn send_alert(&self, summary: &RunSummary) -> Result<()>;
}

/// A run alerts when it pushed obligations into permanent failure or could
/// not check the source at all.
#[inline]
pub fn should_trigger_alert(summary: &RunSummary) -> bool {
    !summary.permanent_failures.is_empty()
        || matches!(
            summary.outcome,
            RunOutcome::SourceUnavailable | RunOutcome::StoreUnavailable
        )
}

/// Log-based alert notifier (default implementation)
pub struct LogAlertNotifier;

#[async_trait::async_trait]
impl AlertNotifier for LogAlertNotifier {
    #[tracing::instrument(skip_all, fields(run_id = %summary.run_id))]
    async fn send_alert(&self, summary: &RunSummary) -> Result<()> {
        tracing::error!(
            outcome = %summary.outcome,
            permanent_failures = summary.permanent_failures.len(),
            awaiting_operator = summary.awaiting_operator.len(),
            error = summary.error.as_deref().unwrap_or(""),
            alert_type = "run_needs_operator",
            "ALERT: run finished with {} permanent failure(s)",
            summary.permanent_failures.len()
        );
        Ok(())
    }
}
