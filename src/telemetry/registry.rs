//! Global Prometheus metrics registry, ported from the teacher's
//! `telemetry/registry.rs` with meshbot's own metric names: resolver runs,
//! tool calls, memory operations, channel adapter health.

use prometheus::{HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::LazyLock;

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

pub struct Metrics {
    pub(crate) registry: Registry,

    /// Total resolver runs. Labels: bot_id, outcome (persisted/cancelled/failed).
    pub resolver_runs_total: IntCounterVec,

    /// Resolver run duration in seconds. Labels: bot_id.
    pub resolver_run_duration_seconds: HistogramVec,

    /// Total tool calls dispatched through the MCP gateway. Labels: bot_id, tool_name.
    pub tool_calls_total: IntCounterVec,

    /// Total memory engine operations. Labels: bot_id, operation (add/search/update/delete).
    pub memory_operations_total: IntCounterVec,

    /// Inbound events currently queued per bot. Labels: bot_id.
    pub inbound_queue_depth: IntGaugeVec,

    /// Channel adapter restarts due to crash/backoff. Labels: bot_id, channel_type.
    pub channel_restarts_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let resolver_runs_total = IntCounterVec::new(
            Opts::new("meshbot_resolver_runs_total", "Total resolver runs"),
            &["bot_id", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        let resolver_run_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "meshbot_resolver_run_duration_seconds",
                "Resolver run duration in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["bot_id"],
        )
        .expect("hardcoded metric descriptor");

        let tool_calls_total = IntCounterVec::new(
            Opts::new("meshbot_tool_calls_total", "Total tool calls dispatched"),
            &["bot_id", "tool_name"],
        )
        .expect("hardcoded metric descriptor");

        let memory_operations_total = IntCounterVec::new(
            Opts::new("meshbot_memory_operations_total", "Total memory engine operations"),
            &["bot_id", "operation"],
        )
        .expect("hardcoded metric descriptor");

        let inbound_queue_depth = IntGaugeVec::new(
            Opts::new("meshbot_inbound_queue_depth", "Inbound events currently queued"),
            &["bot_id"],
        )
        .expect("hardcoded metric descriptor");

        let channel_restarts_total = IntCounterVec::new(
            Opts::new("meshbot_channel_restarts_total", "Channel adapter restarts"),
            &["bot_id", "channel_type"],
        )
        .expect("hardcoded metric descriptor");

        registry.register(Box::new(resolver_runs_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(resolver_run_duration_seconds.clone())).expect("hardcoded metric");
        registry.register(Box::new(tool_calls_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(memory_operations_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(inbound_queue_depth.clone())).expect("hardcoded metric");
        registry.register(Box::new(channel_restarts_total.clone())).expect("hardcoded metric");

        Self {
            registry,
            resolver_runs_total,
            resolver_run_duration_seconds,
            tool_calls_total,
            memory_operations_total,
            inbound_queue_depth,
            channel_restarts_total,
        }
    }

    pub fn global() -> &'static Self {
        &METRICS
    }
}

/// Spawns the `/metrics` + `/health` HTTP server as a background task.
pub async fn start_metrics_server(bind: std::net::SocketAddr) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use prometheus::Encoder as _;

    async fn metrics_handler() -> impl IntoResponse {
        let metrics = Metrics::global();
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        match encoder.encode(&metrics.registry.gather(), &mut buffer) {
            Ok(()) => match String::from_utf8(buffer) {
                Ok(text) => (
                    StatusCode::OK,
                    [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                    text,
                )
                    .into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            },
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }

    async fn health_handler() -> impl IntoResponse {
        StatusCode::OK
    }

    let app = axum::Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(address = %bind, "metrics server started");

    Ok(tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(%error, "metrics server failed");
        }
    }))
}
