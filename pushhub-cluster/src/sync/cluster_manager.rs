//! Cluster-wide delivery
//!
//! Ties the local [`NotificationHub`] to a [`MessageBroker`]:
//! - local fan-out through the hub
//! - publishing to sibling instances
//! - forwarding what siblings publish into the local hub
//!
//! A message is delivered locally exactly once: the publishing node hands it
//! to its own hub directly and the broker drops the copy that echoes back.

use async_trait::async_trait;
use pushhub_core::config::RedisConfig;
use pushhub_core::{Notification, UserId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::broker::{connect_broker, MessageBroker, MessageCallback, NoopBroker};
use super::hub::NotificationHub;
use super::Notifier;
use crate::Result;

/// Cluster configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique identifier for this node, stamped on published envelopes
    pub node_id: String,
    pub redis: RedisConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node_{}", nanoid::nanoid!(8)),
            redis: RedisConfig::default(),
        }
    }
}

pub struct ClusterManager {
    hub: Arc<NotificationHub>,
    broker: Arc<dyn MessageBroker>,
    node_id: String,
    distributed: bool,
}

impl ClusterManager {
    /// Compose a manager from an already-built broker.
    pub fn new(
        hub: Arc<NotificationHub>,
        broker: Arc<dyn MessageBroker>,
        node_id: impl Into<String>,
    ) -> Self {
        let distributed = broker.is_distributed();
        Self {
            hub,
            broker,
            node_id: node_id.into(),
            distributed,
        }
    }

    /// Build the broker from `config`, falling back to single-node mode if
    /// Redis cannot be reached.
    pub async fn connect(config: ClusterConfig, hub: Arc<NotificationHub>) -> Self {
        if !config.redis.enabled {
            warn!("Redis not enabled, running in single-node mode");
            return Self::single_node(hub, config.node_id);
        }

        match connect_broker(&config.redis, config.node_id.as_str()).await {
            Ok(broker) => Self::new(hub, broker, config.node_id),
            Err(e) => {
                error!(
                    error = %e,
                    "Failed to connect to Redis, falling back to single-node mode"
                );
                Self::single_node(hub, config.node_id)
            }
        }
    }

    fn single_node(hub: Arc<NotificationHub>, node_id: String) -> Self {
        Self::new(hub, Arc::new(NoopBroker), node_id)
    }

    /// Start forwarding notifications published by other nodes into the local hub.
    pub async fn start(&self) -> Result<()> {
        let hub = Arc::downgrade(&self.hub);
        let callback: MessageCallback = Arc::new(move |user_id, notification| {
            if let Some(hub) = hub.upgrade() {
                let delivered = hub.notify(user_id, &notification);
                debug!(
                    user_id = %user_id,
                    local_sent = delivered,
                    "Forwarded notification from cluster"
                );
            }
        });
        self.broker.subscribe(callback).await?;
        info!(node_id = %self.node_id, distributed = self.distributed, "Cluster manager started");
        Ok(())
    }

    /// Deliver locally, then publish to the rest of the cluster.
    ///
    /// A failed publish is logged and reported, never fatal: local clients
    /// already have the message.
    pub async fn broadcast(&self, user_id: UserId, notification: &Notification) -> BroadcastResult {
        let local_sent = self.hub.notify(user_id, notification);

        let published = match self.broker.publish_message(user_id, notification).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    user_id = %user_id,
                    "Failed to publish notification to cluster"
                );
                false
            }
        };

        debug!(
            user_id = %user_id,
            local_sent,
            published,
            "Notification broadcast complete"
        );
        BroadcastResult {
            local_sent,
            published,
        }
    }

    /// Close every local connection, then the broker.
    pub async fn shutdown(&self) {
        info!("Shutting down ClusterManager");
        self.hub.shutdown();
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Error while closing message broker");
        }
    }

    #[must_use]
    pub const fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn metrics(&self) -> ClusterMetrics {
        let hub = self.hub.metrics();
        ClusterMetrics {
            node_id: self.node_id.clone(),
            total_users: hub.active_users,
            total_connections: hub.active_connections,
            redis_enabled: self.distributed,
        }
    }
}

#[async_trait]
impl Notifier for ClusterManager {
    async fn notify(&self, user_id: UserId, notification: Notification) {
        self.broadcast(user_id, &notification).await;
    }
}

/// Result of broadcasting a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastResult {
    /// Local connections the notification was queued on
    pub local_sent: usize,
    /// Whether the broker accepted it for the rest of the cluster
    pub published: bool,
}

/// Cluster metrics
#[derive(Debug, Clone)]
pub struct ClusterMetrics {
    pub node_id: String,
    pub total_users: usize,
    pub total_connections: usize,
    pub redis_enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::connection::{Connection, Outbound};
    use crate::Error;
    use parking_lot::Mutex;
    use pushhub_core::ClientToken;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records publishes and lets the test inject "remote" deliveries
    #[derive(Default)]
    struct RecordingBroker {
        published: Mutex<Vec<(UserId, Notification)>>,
        callback: Mutex<Option<MessageCallback>>,
        closed: AtomicBool,
    }

    impl RecordingBroker {
        fn deliver(&self, user_id: UserId, notification: Notification) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(user_id, notification);
            }
        }
    }

    #[async_trait]
    impl MessageBroker for RecordingBroker {
        async fn publish_message(&self, user_id: UserId, notification: &Notification) -> Result<()> {
            self.published.lock().push((user_id, notification.clone()));
            Ok(())
        }

        async fn subscribe(&self, callback: MessageCallback) -> Result<()> {
            *self.callback.lock() = Some(callback);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingBroker;

    #[async_trait]
    impl MessageBroker for FailingBroker {
        async fn publish_message(&self, _: UserId, _: &Notification) -> Result<()> {
            Err(Error::Redis("connection refused".to_string()))
        }

        async fn subscribe(&self, _: MessageCallback) -> Result<()> {
            Err(Error::Timeout("timed out subscribing".to_string()))
        }

        async fn close(&self) -> Result<()> {
            Err(Error::Redis("already gone".to_string()))
        }
    }

    fn connect(hub: &Arc<NotificationHub>, user: u64, token: &str) -> (Arc<Connection>, Outbound) {
        let (connection, outbound) =
            Connection::new(UserId::new(user), ClientToken::from(token), hub.deregister_on_close());
        hub.register(connection.clone()).unwrap();
        (connection, outbound)
    }

    #[tokio::test]
    async fn test_broadcast_delivers_locally_and_publishes() {
        let hub = Arc::new(NotificationHub::new());
        let broker = Arc::new(RecordingBroker::default());
        let manager = ClusterManager::new(hub.clone(), broker.clone(), "node-a");
        let (_conn, mut rx) = connect(&hub, 1, "a");

        let notification = Notification::new(1, "hello");
        let result = manager.broadcast(UserId::new(1), &notification).await;

        assert_eq!(
            result,
            BroadcastResult {
                local_sent: 1,
                published: true
            }
        );
        assert_eq!(rx.recv().await.unwrap(), notification);
        assert_eq!(broker.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_delivery_reaches_local_hub() {
        let hub = Arc::new(NotificationHub::new());
        let broker = Arc::new(RecordingBroker::default());
        let manager = ClusterManager::new(hub.clone(), broker.clone(), "node-a");
        manager.start().await.unwrap();
        let (_conn, mut rx) = connect(&hub, 9, "a");

        broker.deliver(UserId::new(9), Notification::new(1, "from node-b"));

        assert_eq!(rx.recv().await.unwrap().message, "from node-b");
        // Forwarded deliveries are not re-published
        assert!(broker.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_fatal() {
        let hub = Arc::new(NotificationHub::new());
        let manager = ClusterManager::new(hub.clone(), Arc::new(FailingBroker), "node-a");
        let (_conn, mut rx) = connect(&hub, 1, "a");

        let result = manager.broadcast(UserId::new(1), &Notification::new(1, "x")).await;

        assert_eq!(result.local_sent, 1);
        assert!(!result.published);
        assert_eq!(rx.recv().await.unwrap().message, "x");
        assert!(manager.start().await.is_err());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_hub_then_broker() {
        let hub = Arc::new(NotificationHub::new());
        let broker = Arc::new(RecordingBroker::default());
        let manager = ClusterManager::new(hub.clone(), broker.clone(), "node-a");
        let (conn, _rx) = connect(&hub, 1, "a");

        manager.shutdown().await;

        assert!(conn.is_closed());
        assert!(hub.is_shutdown());
        assert!(broker.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreachable_redis_falls_back_to_single_node() {
        let hub = Arc::new(NotificationHub::new());
        let config = ClusterConfig {
            node_id: "node-a".to_string(),
            redis: RedisConfig {
                enabled: true,
                url: "redis://127.0.0.1:1".to_string(),
                timeout_seconds: 1,
                ..RedisConfig::default()
            },
        };

        let manager = ClusterManager::connect(config, hub).await;
        manager.start().await.unwrap();

        let metrics = manager.metrics();
        assert!(!metrics.redis_enabled);
        assert_eq!(metrics.node_id, "node-a");
        assert!(manager.broadcast(UserId::new(1), &Notification::new(1, "x")).await.published);
    }

    #[test]
    fn test_redis_enabled_follows_broker() {
        let hub = Arc::new(NotificationHub::new());
        let single = ClusterManager::new(hub.clone(), Arc::new(NoopBroker), "node-a");
        assert!(!single.metrics().redis_enabled);

        let clustered =
            ClusterManager::new(hub, Arc::new(RecordingBroker::default()), "node-a");
        assert!(clustered.metrics().redis_enabled);
    }

    #[tokio::test]
    async fn test_notifier_trait_broadcasts() {
        let hub = Arc::new(NotificationHub::new());
        let broker = Arc::new(RecordingBroker::default());
        let manager: Arc<dyn Notifier> =
            Arc::new(ClusterManager::new(hub.clone(), broker.clone(), "node-a"));
        let (_conn, mut rx) = connect(&hub, 4, "a");

        manager.notify(UserId::new(4), Notification::new(1, "n")).await;

        assert_eq!(rx.recv().await.unwrap().message, "n");
        assert_eq!(broker.published.lock()[0].0, UserId::new(4));
    }
}
