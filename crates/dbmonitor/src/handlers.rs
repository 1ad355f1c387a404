//! HTTP request handlers: metrics exposition and health.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, TextEncoder};
use tracing::{debug, error};

use dbmonitor_core::collector::Collector;

pub(crate) type AppState = State<Arc<Collector>>;

pub(crate) async fn handle_health() -> &'static str {
    "ok"
}

/// Runs one scrape. Per-instance failures are absorbed by the collector, so
/// only an encoding failure produces a non-200 response.
pub(crate) async fn handle_metrics(State(collector): AppState) -> Response {
    let t0 = Instant::now();

    let families = match collector.gather().await {
        Ok(families) => families,
        Err(e) => {
            error!(error = %e, "failed to build metric families");
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    debug!(
        families = families.len(),
        bytes = buffer.len(),
        duration_ms = t0.elapsed().as_millis() as u64,
        "scrape completed"
    );

    (
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
