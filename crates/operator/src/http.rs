//! Liveness/readiness probes and the Prometheus metrics endpoint.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub async fn serve(port: u16, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz/live", get(|| async { "ok" }))
        .route(
            "/healthz/ready",
            get(move || {
                let ready = ready.clone();
                async move {
                    if ready.load(Ordering::Relaxed) {
                        (StatusCode::OK, "ok")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not leading")
                    }
                }
            }),
        )
        .route("/metrics", get(metrics));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "probe and metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn metrics() -> Result<String, (StatusCode, String)> {
    let mut buffer = String::new();
    prometheus::TextEncoder::new()
        .encode_utf8(&prometheus::gather(), &mut buffer)
        .map_err(|err| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("encoding metrics: {err}"),
            )
        })?;
    Ok(buffer)
}
