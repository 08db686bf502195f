use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "eventagg";

/// Prometheus metrics for node health and aggregation progress.
///
/// All metrics use the "eventagg" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Job runs by job and outcome (completed, skipped, failed).
    pub job_runs: CounterVec,
    /// Job run duration by job, including lock acquisition.
    pub job_duration: HistogramVec,
    /// Runs in which a lock renewal failed.
    pub lock_lost: Counter,
    /// Raw events consumed by aggregation.
    pub events_aggregated: Counter,
    /// Events that addressed an already closed bucket.
    pub late_events: Counter,
    /// Events consumed without contributing to any bucket.
    pub unaggregatable_events: Counter,
    /// Aggregations closed and persisted.
    pub aggregations_closed: Counter,
    /// Batches whose commit failed.
    pub batch_failures: Counter,
    /// Cache rebuilds from persisted state.
    pub cache_restores: Counter,
    /// Open accumulators held by this node.
    pub open_aggregations: Gauge,
    /// Dimension rows created by kind (date, time).
    pub dimension_rows_created: CounterVec,
    /// Rows purged by kind (raw_event, event_session, cluster_mutex).
    pub rows_purged: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let job_runs = CounterVec::new(
            Opts::new("job_runs_total", "Total job runs by job and outcome.").namespace(NAMESPACE),
            &["job", "outcome"],
        )?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new(
                "job_duration_seconds",
                "Job run duration by job, including lock acquisition.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
            &["job"],
        )?;
        let lock_lost = Counter::with_opts(
            Opts::new(
                "lock_lost_total",
                "Total runs in which a cluster lock renewal failed.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_aggregated = Counter::with_opts(
            Opts::new(
                "events_aggregated_total",
                "Total raw events consumed by aggregation.",
            )
            .namespace(NAMESPACE),
        )?;
        let late_events = Counter::with_opts(
            Opts::new(
                "late_events_total",
                "Total events addressed to an already closed bucket.",
            )
            .namespace(NAMESPACE),
        )?;
        let unaggregatable_events = Counter::with_opts(
            Opts::new(
                "unaggregatable_events_total",
                "Total events whose date or buckets could not be resolved.",
            )
            .namespace(NAMESPACE),
        )?;
        let aggregations_closed = Counter::with_opts(
            Opts::new(
                "aggregations_closed_total",
                "Total aggregations closed and persisted.",
            )
            .namespace(NAMESPACE),
        )?;
        let batch_failures = Counter::with_opts(
            Opts::new(
                "batch_failures_total",
                "Total aggregation batches that failed and were discarded.",
            )
            .namespace(NAMESPACE),
        )?;
        let cache_restores = Counter::with_opts(
            Opts::new(
                "cache_restores_total",
                "Total aggregation cache rebuilds from persisted state.",
            )
            .namespace(NAMESPACE),
        )?;
        let open_aggregations = Gauge::with_opts(
            Opts::new(
                "open_aggregations",
                "Number of open accumulators held by this node.",
            )
            .namespace(NAMESPACE),
        )?;
        let dimension_rows_created = CounterVec::new(
            Opts::new(
                "dimension_rows_created_total",
                "Total dimension rows created by kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let rows_purged = CounterVec::new(
            Opts::new("rows_purged_total", "Total rows purged by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(job_runs.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;
        registry.register(Box::new(lock_lost.clone()))?;
        registry.register(Box::new(events_aggregated.clone()))?;
        registry.register(Box::new(late_events.clone()))?;
        registry.register(Box::new(unaggregatable_events.clone()))?;
        registry.register(Box::new(aggregations_closed.clone()))?;
        registry.register(Box::new(batch_failures.clone()))?;
        registry.register(Box::new(cache_restores.clone()))?;
        registry.register(Box::new(open_aggregations.clone()))?;
        registry.register(Box::new(dimension_rows_created.clone()))?;
        registry.register(Box::new(rows_purged.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            job_runs,
            job_duration,
            lock_lost,
            events_aggregated,
            late_events,
            unaggregatable_events,
            aggregations_closed,
            batch_failures,
            cache_restores,
            open_aggregations,
            dimension_rows_created,
            rows_purged,
        })
    }

    /// Encodes every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // ":port" listens on all interfaces.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
