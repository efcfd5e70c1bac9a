use anyhow::{Context, Result};
use pushhub_api::{create_router, AppState};
use pushhub_cluster::ClusterManager;
use std::sync::Arc;
use tracing::{error, info};

/// HTTP server plus the cluster it serves
pub struct PushHubServer {
    http_address: String,
    state: AppState,
    cluster: Arc<ClusterManager>,
}

impl PushHubServer {
    pub const fn new(http_address: String, state: AppState, cluster: Arc<ClusterManager>) -> Self {
        Self {
            http_address,
            state,
            cluster,
        }
    }

    /// Serve until a shutdown signal arrives, then tear everything down.
    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.http_address)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {}", self.http_address))?;
        info!("HTTP server listening on {}", self.http_address);

        let router = create_router(self.state);
        let cluster = self.cluster.clone();

        // Open streams never finish on their own; close them as soon as the signal
        // arrives so the graceful shutdown can complete.
        let graceful = async move {
            shutdown_signal().await;
            info!("Shutdown signal received, starting graceful shutdown...");
            cluster.hub().shutdown();
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(graceful)
            .await
        {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP server shut down gracefully");

        self.cluster.shutdown().await;
        info!("pushhub server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
