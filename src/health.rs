use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "bucketeer";

/// Prometheus metrics for the pipeline itself.
///
/// All metrics use the "bucketeer" namespace and are registered on a private
/// registry, so several instances can coexist in one test binary.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Span events accepted by the HTTP receiver.
    pub spans_received: Counter,
    /// Span events rejected while deriving records.
    pub spans_rejected: Counter,

    // === Workers ===
    /// Messages accepted into a worker queue, by role.
    pub records_enqueued: CounterVec,
    /// Messages refused because the worker queue was full, by role.
    pub queue_saturated: CounterVec,
    /// Messages dropped because they could not merge into the buffer, by role.
    pub merge_mismatches: CounterVec,
    /// Flush ticks that emitted at least one record, by role.
    pub worker_flushes: CounterVec,
    /// Records emitted by flushes, by role.
    pub worker_flushed_records: CounterVec,
    /// Flush duration by role (100us-5s buckets).
    pub worker_flush_duration: HistogramVec,
    /// Current queue capacity per role.
    pub worker_queue_capacity: GaugeVec,

    // === Remote ===
    /// Dispatch decisions by role and destination (local/remote).
    pub remote_dispatch: CounterVec,
    /// Remote sends dropped by role and reason.
    pub remote_failures: CounterVec,
    /// Records received from peers, by role.
    pub remote_received: CounterVec,
    /// Number of nodes in the current topology.
    pub topology_size: Gauge,

    // === Storage ===
    /// Per-id read failures during flush, by table.
    pub storage_read_failures: CounterVec,
    /// Per-item write failures, by table.
    pub storage_write_failures: CounterVec,
    /// Storage engine reachability (1=yes, 0=no).
    pub storage_connected: GaugeVec,
    /// Batch submit duration by engine (1ms-10s buckets).
    pub batch_duration: HistogramVec,
    /// Batch size in operations, by engine.
    pub batch_size: HistogramVec,
    /// Batch retry attempts, by engine.
    pub batch_retries: CounterVec,
    /// Retention deletes issued, by table.
    pub history_deletes: CounterVec,

    // === Graph ===
    /// Stage failures, by node.
    pub graph_stage_errors: CounterVec,
}

fn counter(name: &str, help: &str) -> Result<Counter> {
    Ok(Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?)
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    Ok(CounterVec::new(
        Opts::new(name, help).namespace(NAMESPACE),
        labels,
    )?)
}

fn histogram_vec(name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> Result<HistogramVec> {
    Ok(HistogramVec::new(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets),
        labels,
    )?)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let spans_received = counter(
            "spans_received_total",
            "Total span events accepted by the receiver.",
        )?;
        let spans_rejected = counter(
            "spans_rejected_total",
            "Total span events rejected while deriving records.",
        )?;

        // === Workers ===
        let records_enqueued = counter_vec(
            "records_enqueued_total",
            "Total messages accepted into a worker queue by role.",
            &["role"],
        )?;
        let queue_saturated = counter_vec(
            "queue_saturated_total",
            "Total messages refused by a full worker queue by role.",
            &["role"],
        )?;
        let merge_mismatches = counter_vec(
            "merge_mismatches_total",
            "Total messages dropped on merge schema mismatch by role.",
            &["role"],
        )?;
        let worker_flushes = counter_vec(
            "worker_flushes_total",
            "Total non-empty worker flushes by role.",
            &["role"],
        )?;
        let worker_flushed_records = counter_vec(
            "worker_flushed_records_total",
            "Total records emitted by worker flushes by role.",
            &["role"],
        )?;
        let worker_flush_duration = histogram_vec(
            "worker_flush_duration_seconds",
            "Worker flush duration by role.",
            vec![0.0001, 0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            &["role"],
        )?;
        let worker_queue_capacity = GaugeVec::new(
            Opts::new("worker_queue_capacity", "Configured queue capacity by role.")
                .namespace(NAMESPACE),
            &["role"],
        )?;

        // === Remote ===
        let remote_dispatch = counter_vec(
            "remote_dispatch_total",
            "Total dispatch decisions by role and destination.",
            &["role", "destination"],
        )?;
        let remote_failures = counter_vec(
            "remote_failures_total",
            "Total remote sends dropped by role and reason.",
            &["role", "reason"],
        )?;
        let remote_received = counter_vec(
            "remote_received_total",
            "Total records received from peers by role.",
            &["role"],
        )?;
        let topology_size = Gauge::with_opts(
            Opts::new("topology_size", "Number of nodes in the current topology.")
                .namespace(NAMESPACE),
        )?;

        // === Storage ===
        let storage_read_failures = counter_vec(
            "storage_read_failures_total",
            "Total per-id storage read failures by table.",
            &["table"],
        )?;
        let storage_write_failures = counter_vec(
            "storage_write_failures_total",
            "Total per-item storage write failures by table.",
            &["table"],
        )?;
        let storage_connected = GaugeVec::new(
            Opts::new(
                "storage_connected",
                "Whether the storage engine is reachable (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
            &["engine"],
        )?;
        let batch_duration = histogram_vec(
            "batch_duration_seconds",
            "Batch submit duration by engine.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0],
            &["engine"],
        )?;
        let batch_size = histogram_vec(
            "batch_size",
            "Operations per submitted batch by engine.",
            vec![1.0, 10.0, 100.0, 1000.0, 5000.0, 20000.0],
            &["engine"],
        )?;
        let batch_retries = counter_vec(
            "batch_retries_total",
            "Total batch retry attempts by engine.",
            &["engine"],
        )?;
        let history_deletes = counter_vec(
            "history_deletes_total",
            "Total retention deletes issued by table.",
            &["table"],
        )?;

        // === Graph ===
        let graph_stage_errors = counter_vec(
            "graph_stage_errors_total",
            "Total graph stage failures by node.",
            &["node"],
        )?;

        registry.register(Box::new(spans_received.clone()))?;
        registry.register(Box::new(spans_rejected.clone()))?;
        registry.register(Box::new(records_enqueued.clone()))?;
        registry.register(Box::new(queue_saturated.clone()))?;
        registry.register(Box::new(merge_mismatches.clone()))?;
        registry.register(Box::new(worker_flushes.clone()))?;
        registry.register(Box::new(worker_flushed_records.clone()))?;
        registry.register(Box::new(worker_flush_duration.clone()))?;
        registry.register(Box::new(worker_queue_capacity.clone()))?;
        registry.register(Box::new(remote_dispatch.clone()))?;
        registry.register(Box::new(remote_failures.clone()))?;
        registry.register(Box::new(remote_received.clone()))?;
        registry.register(Box::new(topology_size.clone()))?;
        registry.register(Box::new(storage_read_failures.clone()))?;
        registry.register(Box::new(storage_write_failures.clone()))?;
        registry.register(Box::new(storage_connected.clone()))?;
        registry.register(Box::new(batch_duration.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(batch_retries.clone()))?;
        registry.register(Box::new(history_deletes.clone()))?;
        registry.register(Box::new(graph_stage_errors.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            spans_received,
            spans_rejected,
            records_enqueued,
            queue_saturated,
            merge_mismatches,
            worker_flushes,
            worker_flushed_records,
            worker_flush_duration,
            worker_queue_capacity,
            remote_dispatch,
            remote_failures,
            remote_received,
            topology_size,
            storage_read_failures,
            storage_write_failures,
            storage_connected,
            batch_duration,
            batch_size,
            batch_retries,
            history_deletes,
            graph_stage_errors,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
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

        // Parse address, handling ":port" shorthand.
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

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.records_enqueued.with_label_values(&["agg"]).inc();
        health.topology_size.set(3.0);

        let text = health.render().expect("render");
        assert!(text.contains("bucketeer_records_enqueued_total{role=\"agg\"} 1"));
        assert!(text.contains("bucketeer_topology_size 3"));
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = HealthMetrics::new(":0").expect("a");
        let b = HealthMetrics::new(":0").expect("b");
        a.spans_received.inc_by(5.0);
        assert_eq!(a.spans_received.get(), 5.0);
        assert_eq!(b.spans_received.get(), 0.0);
    }
}
