use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "httpmon" namespace. These cover the operational
/// surface of the consumer; the HTTP request counters themselves live in
/// [`crate::telemetry`] and are exposed through the stats API.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total page-fill notifications received from the probe.
    pub notifications_received: Counter,
    /// Total pages lost to producer overrun (dirty slots).
    pub pages_lost: Counter,
    /// Total transactions drained, labeled by drain path.
    pub transactions_drained: CounterVec,
    /// Total pending sweeps executed.
    pub pending_sweeps: Counter,
    /// Total page map lookup failures on the notification path.
    pub map_lookup_failures: Counter,
    /// Total idle in-flight entries purged from the kernel map.
    pub inflight_purged: Counter,
    /// Total destructive stat flushes served.
    pub stat_flushes: Counter,
    /// Endpoint keys returned by the most recent stat flush.
    pub flushed_keys: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let notifications_received = Counter::with_opts(
            Opts::new(
                "notifications_received_total",
                "Total page-fill notifications received from the probe.",
            )
            .namespace("httpmon"),
        )?;
        let pages_lost = Counter::with_opts(
            Opts::new(
                "pages_lost_total",
                "Total pages lost to producer overrun before userspace could read them.",
            )
            .namespace("httpmon"),
        )?;
        let transactions_drained = CounterVec::new(
            Opts::new(
                "transactions_drained_total",
                "Total transactions drained from the page map by drain path.",
            )
            .namespace("httpmon"),
            &["path"],
        )?;
        let pending_sweeps = Counter::with_opts(
            Opts::new("pending_sweeps_total", "Total pending sweeps executed.")
                .namespace("httpmon"),
        )?;
        let map_lookup_failures = Counter::with_opts(
            Opts::new(
                "map_lookup_failures_total",
                "Total page map lookup failures on the notification path.",
            )
            .namespace("httpmon"),
        )?;
        let inflight_purged = Counter::with_opts(
            Opts::new(
                "inflight_purged_total",
                "Total idle in-flight entries purged from the kernel map.",
            )
            .namespace("httpmon"),
        )?;
        let stat_flushes = Counter::with_opts(
            Opts::new("stat_flushes_total", "Total destructive stat flushes served.")
                .namespace("httpmon"),
        )?;
        let flushed_keys = Gauge::with_opts(
            Opts::new(
                "flushed_keys",
                "Endpoint keys returned by the most recent stat flush.",
            )
            .namespace("httpmon"),
        )?;

        registry.register(Box::new(notifications_received.clone()))?;
        registry.register(Box::new(pages_lost.clone()))?;
        registry.register(Box::new(transactions_drained.clone()))?;
        registry.register(Box::new(pending_sweeps.clone()))?;
        registry.register(Box::new(map_lookup_failures.clone()))?;
        registry.register(Box::new(inflight_purged.clone()))?;
        registry.register(Box::new(stat_flushes.clone()))?;
        registry.register(Box::new(flushed_keys.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            notifications_received,
            pages_lost,
            transactions_drained,
            pending_sweeps,
            map_lookup_failures,
            inflight_purged,
            stat_flushes,
            flushed_keys,
        })
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

            let result = axum::serve(listener, app)
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

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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
