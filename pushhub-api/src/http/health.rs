//! Health check endpoint
//!
//! Reports liveness plus the local connection counts for monitoring probes.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub users: usize,
}

/// Always OK while the server is running
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let metrics = state.hub().metrics();
    Json(HealthResponse {
        status: "ok",
        connections: metrics.active_connections,
        users: metrics.active_users,
    })
}
