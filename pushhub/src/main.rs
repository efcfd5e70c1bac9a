mod server;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use pushhub_api::http::OriginPolicy;
use pushhub_api::AppState;
use pushhub_cluster::sync::{ClusterConfig, ClusterManager, HubLimits, KeepaliveSettings, NotificationHub};
use pushhub_core::{bootstrap::load_config, logging, StaticTokenAuthenticator};

use server::PushHubServer;

#[derive(Parser, Debug)]
#[command(name = "pushhub")]
#[command(about = "Real-time push notification server", long_about = None)]
struct Args {
    /// Path to a YAML/TOML config file
    #[arg(long, short)]
    config: Option<String>,

    /// Node ID (auto-generated from hostname if not provided)
    #[arg(long, env = "PUSHHUB_NODE_ID")]
    node_id: Option<String>,
}

/// Generate a unique node ID for this server instance
fn generate_node_id() -> String {
    use std::net::UdpSocket;

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    // No packet is sent; connecting a UDP socket only picks the outbound interface
    let local_ip = UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or_else(|_| "0.0.0.0".to_string(), |addr| addr.ip().to_string());

    let suffix = nanoid::nanoid!(6);

    format!("{hostname}_{local_ip}-{suffix}")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("pushhub server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Registry of live connections
    let hub = Arc::new(NotificationHub::with_limits(HubLimits {
        max_per_user: config.stream.max_per_user,
        max_total: config.stream.max_total,
    }));

    // 4. Cluster fan-out (falls back to single-node mode without Redis)
    let node_id = args.node_id.unwrap_or_else(generate_node_id);
    info!(node_id = %node_id, "Node identity");
    let cluster = Arc::new(
        ClusterManager::connect(
            ClusterConfig {
                node_id,
                redis: config.redis.clone(),
            },
            hub,
        )
        .await,
    );
    cluster
        .start()
        .await
        .context("Failed to subscribe to cluster notifications")?;

    // 5. HTTP surface
    let authenticator = StaticTokenAuthenticator::from_config(&config.auth);
    if authenticator.is_empty() {
        tracing::warn!("No client tokens configured; every stream request will be rejected");
    }
    let origin_policy =
        OriginPolicy::new(&config.stream.allowed_origins).context("Invalid allowed origin pattern")?;
    let state = AppState::new(
        cluster.clone(),
        Arc::new(authenticator),
        KeepaliveSettings::from(&config.stream),
        origin_policy,
    );

    PushHubServer::new(config.http_address(), state, cluster)
        .run()
        .await
}
