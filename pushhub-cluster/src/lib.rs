pub mod error;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{
    ClusterManager, Connection, KeepaliveSettings, MessageBroker, NoopBroker, NotificationHub,
    Notifier, RedisBroker,
};
