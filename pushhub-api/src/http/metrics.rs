use axum::{http::header, response::IntoResponse, routing::get, Router};
use pushhub_core::metrics::gather_metrics;

use crate::http::{AppError, AppResult, AppState};

/// Prometheus scrape endpoint
pub fn create_metrics_router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}

pub async fn metrics_handler() -> AppResult<impl IntoResponse> {
    let body = gather_metrics()
        .map_err(|e| AppError::internal(format!("Failed to gather metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}
