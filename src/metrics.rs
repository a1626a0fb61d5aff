//! Prometheus metrics for introspection sessions
//!
//! All metrics live in the default registry. `gather()` renders them in the
//! text exposition format and `serve()` exposes that at `GET /metrics`.

use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

lazy_static! {
    /// Activations by outcome ("persisted", "failed", "conflict", ...)
    pub static ref ACTIVATIONS_TOTAL: CounterVec = register_counter_vec!(
        "introvisor_activations_total",
        "Introspection activations by outcome",
        &["outcome"]
    ).expect("failed to register ACTIVATIONS_TOTAL metric");

    /// Wall time from activate() to a persisted entity.
    ///
    /// Dominated by the crawl, which scales with disk size.
    pub static ref ACTIVATION_DURATION: Histogram = register_histogram!(
        "introvisor_activation_duration_seconds",
        "Time from activation request to persisted entity",
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    ).expect("failed to register ACTIVATION_DURATION metric");

    /// Sessions whose export is currently live
    pub static ref ACTIVE_SESSIONS: Gauge = register_gauge!(
        "introvisor_active_sessions",
        "Introspection sessions with a live block export"
    ).expect("failed to register ACTIVE_SESSIONS metric");

    /// Failures by the session state they happened in and the error kind
    pub static ref STAGE_FAILURES: CounterVec = register_counter_vec!(
        "introvisor_stage_failures_total",
        "Activation failures by session stage and error kind",
        &["stage", "kind"]
    ).expect("failed to register STAGE_FAILURES metric");

    /// Runtime of each external tool invocation
    pub static ref TOOL_DURATION: HistogramVec = register_histogram_vec!(
        "introvisor_tool_duration_seconds",
        "External tool runtime",
        &["tool"],
        vec![0.1, 1.0, 10.0, 60.0, 300.0, 1800.0]
    ).expect("failed to register TOOL_DURATION metric");

    /// Random picks needed to find a free port
    pub static ref PORT_ALLOCATION_ATTEMPTS: Histogram = register_histogram!(
        "introvisor_port_allocation_attempts",
        "Attempts needed to find a free ephemeral port",
        vec![1.0, 2.0, 4.0, 8.0, 32.0, 128.0]
    ).expect("failed to register PORT_ALLOCATION_ATTEMPTS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = if req.uri().path() == "/metrics" {
        Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(gather())))
    } else {
        Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found\n")))
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

/// Serve `/metrics` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listener started");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle))
                .await
            {
                tracing::debug!(%peer, error = %e, "metrics connection closed with error");
            }
        });
    }

    tracing::info!("metrics listener stopped");
    Ok(())
}
