//! Tracing/logging bootstrap (`spec.md` §7 "(added) Logging"): structured
//! `tracing` output to stdout plus a rolling file under the data directory,
//! with OpenTelemetry span export activated only when an OTLP endpoint is
//! configured. Prometheus metric handles live in [`registry`], feature-gated
//! behind `metrics` the same way the rest of the ambient stack is optional.

#[cfg(feature = "metrics")]
pub mod registry;

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Held for the process lifetime so the rolling file writer doesn't flush
/// and drop its background worker early.
pub struct LoggingGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Initializes the global `tracing` subscriber: `EnvFilter` from
/// `RUST_LOG` (default `info`), human-readable stdout, JSON lines to a
/// daily-rolling file under `data_dir/logs`, and an OTLP span exporter if
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set in the environment.
pub fn init(data_dir: &Path) -> anyhow::Result<LoggingGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "meshbot.log");
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);
    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_ansi(false);

    let otel_layer = otel_span_layer()?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .with(otel_layer)
        .init();

    Ok(LoggingGuard { _file_guard: file_guard })
}

/// Builds the OTLP tracing layer if `OTEL_EXPORTER_OTLP_ENDPOINT` is set;
/// otherwise returns `None` so `init` runs with no OpenTelemetry export at
/// all rather than failing to construct an exporter with nowhere to send to.
fn otel_span_layer<S>() -> anyhow::Result<Option<Box<dyn Layer<S> + Send + Sync + 'static>>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") else {
        return Ok(None);
    };

    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(&endpoint)
        .build()?;

    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(opentelemetry_sdk::Resource::new(vec![
            opentelemetry::KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                "meshbot",
            ),
        ]))
        .build();

    let tracer = provider.tracer("meshbot");
    opentelemetry::global::set_tracer_provider(provider);

    Ok(Some(Box::new(tracing_opentelemetry::layer().with_tracer(tracer))))
}
