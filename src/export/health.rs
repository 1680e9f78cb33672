use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "shardlens";

/// Prometheus metrics for reader health.
///
/// All metrics use the "shardlens" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed reader cycles.
    pub cycles: Counter,
    /// Reader cycles that returned an error.
    pub cycle_failures: Counter,
    /// Wall time of one reader cycle (5ms-10s buckets).
    pub cycle_duration: Histogram,
    /// Leaf files parsed by family.
    pub files_parsed: CounterVec,
    /// Leaf files skipped by the mtime filter, by family.
    pub files_skipped: CounterVec,
    /// Leaf files that could not be read or parsed, by family.
    pub file_errors: CounterVec,
    /// Raw snapshots currently retained, by family.
    pub snapshots_retained: GaugeVec,
    /// Windows with no usable snapshot, by family and reason.
    pub windows_skipped: CounterVec,
    /// Output rows written, by emission procedure.
    pub output_rows: CounterVec,
    /// Thread cross-check violations.
    pub consistency_violations: Counter,
    /// Key of the newest committed output bucket.
    pub latest_bucket: Gauge,
    /// Nodes in the last loaded cluster topology.
    pub topology_nodes: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Total completed reader cycles.").namespace(NAMESPACE),
        )?;
        let cycle_failures = Counter::with_opts(
            Opts::new("cycle_failures_total", "Total reader cycles that failed.")
                .namespace(NAMESPACE),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Reader cycle duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let files_parsed = CounterVec::new(
            Opts::new("files_parsed_total", "Total leaf files parsed by family.")
                .namespace(NAMESPACE),
            &["family"],
        )?;
        let files_skipped = CounterVec::new(
            Opts::new(
                "files_skipped_total",
                "Total leaf files outside the scan range by family.",
            )
            .namespace(NAMESPACE),
            &["family"],
        )?;
        let file_errors = CounterVec::new(
            Opts::new(
                "file_errors_total",
                "Total unreadable or corrupt leaf files by family.",
            )
            .namespace(NAMESPACE),
            &["family"],
        )?;
        let snapshots_retained = GaugeVec::new(
            Opts::new(
                "snapshots_retained",
                "Raw snapshots currently retained by family.",
            )
            .namespace(NAMESPACE),
            &["family"],
        )?;
        let windows_skipped = CounterVec::new(
            Opts::new(
                "windows_skipped_total",
                "Total windows emitted without a family by reason.",
            )
            .namespace(NAMESPACE),
            &["family", "reason"],
        )?;
        let output_rows = CounterVec::new(
            Opts::new(
                "output_rows_total",
                "Total output rows written by emission procedure.",
            )
            .namespace(NAMESPACE),
            &["procedure"],
        )?;
        let consistency_violations = Counter::with_opts(
            Opts::new(
                "consistency_violations_total",
                "Total thread cross-check violations.",
            )
            .namespace(NAMESPACE),
        )?;
        let latest_bucket = Gauge::with_opts(
            Opts::new(
                "latest_bucket_millis",
                "Key of the newest committed output bucket.",
            )
            .namespace(NAMESPACE),
        )?;
        let topology_nodes = Gauge::with_opts(
            Opts::new("topology_nodes", "Nodes in the last loaded topology.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_failures.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(files_parsed.clone()))?;
        registry.register(Box::new(files_skipped.clone()))?;
        registry.register(Box::new(file_errors.clone()))?;
        registry.register(Box::new(snapshots_retained.clone()))?;
        registry.register(Box::new(windows_skipped.clone()))?;
        registry.register(Box::new(output_rows.clone()))?;
        registry.register(Box::new(consistency_violations.clone()))?;
        registry.register(Box::new(latest_bucket.clone()))?;
        registry.register(Box::new(topology_nodes.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_failures,
            cycle_duration,
            files_parsed,
            files_skipped,
            file_errors,
            snapshots_retained,
            windows_skipped,
            output_rows,
            consistency_violations,
            latest_bucket,
            topology_nodes,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9091"
        } else {
            &self.addr
        };

        // ":port" binds all interfaces.
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

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
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
    fn test_metrics_registered_under_namespace() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.cycles.inc();
        metrics
            .files_parsed
            .with_label_values(&["os_threads"])
            .inc_by(3.0);
        metrics
            .windows_skipped
            .with_label_values(&["disk", "writer_gap"])
            .inc();
        metrics.latest_bucket.set(10_000.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("shardlens_cycles_total 1"));
        assert!(text.contains("shardlens_files_parsed_total{family=\"os_threads\"} 3"));
        assert!(text.contains("reason=\"writer_gap\""));
        assert!(text.contains("shardlens_latest_bucket_millis 10000"));
    }

    #[tokio::test]
    async fn test_server_serves_healthz_and_stops() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = metrics.start().await.expect("start");

        let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .expect("read");
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        metrics.stop();
    }
}
