// Module: sync

pub mod broker;
pub mod cluster_manager;
pub mod connection;
pub mod events;
pub mod hub;
pub mod redis_pubsub;
pub mod transport;

use async_trait::async_trait;
use pushhub_core::{Notification, UserId};

pub use broker::{connect_broker, MessageBroker, MessageCallback, NoopBroker};
pub use cluster_manager::{BroadcastResult, ClusterConfig, ClusterManager, ClusterMetrics};
pub use connection::{
    CloseOnce, Connection, ConnectionId, EnqueueOutcome, KeepaliveSettings, Outbound,
    OUTBOUND_CAPACITY,
};
pub use events::Envelope;
pub use hub::{HubLimits, HubMetrics, NotificationHub};
pub use redis_pubsub::RedisBroker;
pub use transport::{FrameReader, FrameWriter, InboundFrame};

/// Delivery seam consumed by message-creation code
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notification` to every live connection of `user_id`.
    async fn notify(&self, user_id: UserId, notification: Notification);
}
