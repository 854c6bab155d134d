use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "zmq_receiver";

/// Prometheus metrics for receiver health and observability.
///
/// All metrics use the "zmq_receiver" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Transport ===
    /// Requests sent upstream.
    pub requests_sent: Counter,
    /// Replies received on the inbound channel.
    pub replies_received: Counter,
    /// Waits that hit the reply timeout.
    pub peer_timeouts: Counter,
    /// Successful channel reopens after a timeout.
    pub reconnects: Counter,
    /// Transport errors by kind.
    pub transport_errors: CounterVec,
    /// Control commands by command.
    pub control_commands: CounterVec,

    // === Decoding ===
    /// Decoded frame pairs by kind.
    pub frames: CounterVec,
    /// Frame pairs that failed to decode.
    pub decode_errors: Counter,
    /// Objects decoded from data frames.
    pub objects_received: Counter,
    /// Objects skipped by the identifier filter.
    pub objects_filtered: Counter,

    // === Aggregation ===
    /// Objects dropped on merge because of shape mismatch.
    pub merge_errors: Counter,
    /// Flushes by reason (boundary, end_of_run, control, shutdown).
    pub flushes: CounterVec,
    /// Groups written across all flushes.
    pub flushed_objects: Counter,
    /// Time to merge and persist a snapshot.
    pub flush_duration: Histogram,
    /// Snapshot writes that failed.
    pub sink_errors: Counter,
    /// Groups dropped without a flush (missed EOR, reset).
    pub discarded_groups: Counter,
    /// Groups currently held in the store.
    pub current_groups: Gauge,
    /// Whether the round boundary is locked in (1=yes, 0=no).
    pub boundary_locked: Gauge,
    /// Current run number, the unknown sentinel while unknown.
    pub current_run: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Transport ===
        let requests_sent = Counter::with_opts(
            Opts::new("requests_sent_total", "Total requests sent upstream.").namespace(NAMESPACE),
        )?;
        let replies_received = Counter::with_opts(
            Opts::new(
                "replies_received_total",
                "Total replies received on the inbound channel.",
            )
            .namespace(NAMESPACE),
        )?;
        let peer_timeouts = Counter::with_opts(
            Opts::new(
                "peer_timeouts_total",
                "Total waits that hit the reply timeout.",
            )
            .namespace(NAMESPACE),
        )?;
        let reconnects = Counter::with_opts(
            Opts::new("reconnects_total", "Total successful channel reopens.")
                .namespace(NAMESPACE),
        )?;
        let transport_errors = CounterVec::new(
            Opts::new(
                "transport_errors_total",
                "Total transport errors by error kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let control_commands = CounterVec::new(
            Opts::new(
                "control_commands_total",
                "Total control channel commands by command.",
            )
            .namespace(NAMESPACE),
            &["command"],
        )?;

        // === Decoding ===
        let frames = CounterVec::new(
            Opts::new("frames_total", "Total decoded frame pairs by kind.").namespace(NAMESPACE),
            &["kind"],
        )?;
        let decode_errors = Counter::with_opts(
            Opts::new(
                "decode_errors_total",
                "Total frame pairs that failed to decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let objects_received = Counter::with_opts(
            Opts::new(
                "objects_received_total",
                "Total objects decoded from data frames.",
            )
            .namespace(NAMESPACE),
        )?;
        let objects_filtered = Counter::with_opts(
            Opts::new(
                "objects_filtered_total",
                "Total objects skipped by the identifier filter.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Aggregation ===
        let merge_errors = Counter::with_opts(
            Opts::new(
                "merge_errors_total",
                "Total objects dropped because their shape did not match.",
            )
            .namespace(NAMESPACE),
        )?;
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Total snapshot flushes by reason.").namespace(NAMESPACE),
            &["reason"],
        )?;
        let flushed_objects = Counter::with_opts(
            Opts::new(
                "flushed_objects_total",
                "Total groups written across all flushes.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time to merge and persist a snapshot.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let sink_errors = Counter::with_opts(
            Opts::new("sink_errors_total", "Total snapshot writes that failed.")
                .namespace(NAMESPACE),
        )?;
        let discarded_groups = Counter::with_opts(
            Opts::new(
                "discarded_groups_total",
                "Total groups dropped without a flush.",
            )
            .namespace(NAMESPACE),
        )?;
        let current_groups = Gauge::with_opts(
            Opts::new("current_groups", "Groups currently held in the store.")
                .namespace(NAMESPACE),
        )?;
        let boundary_locked = Gauge::with_opts(
            Opts::new(
                "boundary_locked",
                "Whether the round boundary is locked in (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let current_run = Gauge::with_opts(
            Opts::new("current_run", "Current run number.").namespace(NAMESPACE),
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(requests_sent.clone()))?;
        registry.register(Box::new(replies_received.clone()))?;
        registry.register(Box::new(peer_timeouts.clone()))?;
        registry.register(Box::new(reconnects.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;
        registry.register(Box::new(control_commands.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(objects_received.clone()))?;
        registry.register(Box::new(objects_filtered.clone()))?;
        registry.register(Box::new(merge_errors.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flushed_objects.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(sink_errors.clone()))?;
        registry.register(Box::new(discarded_groups.clone()))?;
        registry.register(Box::new(current_groups.clone()))?;
        registry.register(Box::new(boundary_locked.clone()))?;
        registry.register(Box::new(current_run.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            requests_sent,
            replies_received,
            peer_timeouts,
            reconnects,
            transport_errors,
            control_commands,
            frames,
            decode_errors,
            objects_received,
            objects_filtered,
            merge_errors,
            flushes,
            flushed_objects,
            flush_duration,
            sink_errors,
            discarded_groups,
            current_groups,
            boundary_locked,
            current_run,
        })
    }

    /// Whether an HTTP listen address was configured.
    pub fn enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        render_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    /// Does nothing when no address is configured.
    pub async fn start(&self) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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

fn render_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
        let health = HealthMetrics::new("").expect("metrics");
        health.requests_sent.inc();
        health.flushes.with_label_values(&["end_of_run"]).inc();
        health.current_run.set(246_980.0);

        let text = health.render().expect("render");

        assert!(text.contains("zmq_receiver_requests_sent_total 1"));
        assert!(text.contains("zmq_receiver_flushes_total{reason=\"end_of_run\"} 1"));
        assert!(text.contains("zmq_receiver_current_run 246980"));
    }

    #[tokio::test]
    async fn test_start_without_address_is_noop() {
        let health = HealthMetrics::new("").expect("metrics");
        assert!(!health.enabled());
        health.start().await.expect("noop start");
        health.stop().await.expect("noop stop");
    }
}
