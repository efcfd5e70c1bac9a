// Module: http
// Stream upgrade endpoint plus health and metrics

pub mod error;
pub mod health;
pub mod metrics;
pub mod middleware;
pub mod origin;
pub mod websocket;

use axum::{routing::get, Router};
use pushhub_cluster::{ClusterManager, KeepaliveSettings, NotificationHub};
use pushhub_core::Authenticator;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};
pub use middleware::AuthUser;
pub use origin::OriginPolicy;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<ClusterManager>,
    pub authenticator: Arc<dyn Authenticator>,
    pub keepalive: KeepaliveSettings,
    pub origin_policy: Arc<OriginPolicy>,
}

impl AppState {
    pub fn new(
        cluster: Arc<ClusterManager>,
        authenticator: Arc<dyn Authenticator>,
        keepalive: KeepaliveSettings,
        origin_policy: OriginPolicy,
    ) -> Self {
        Self {
            cluster,
            authenticator,
            keepalive,
            origin_policy: Arc::new(origin_policy),
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        self.cluster.hub()
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(websocket::stream_handler))
        .merge(health::create_health_router())
        .merge(metrics::create_metrics_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
