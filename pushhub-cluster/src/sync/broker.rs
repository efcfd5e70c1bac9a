//! Cross-instance message broker abstraction
//!
//! Calling code is written once against [`MessageBroker`]; the variant is
//! chosen at startup from configuration: [`RedisBroker`] for multi-instance
//! deployments, [`NoopBroker`] when the process runs alone.

use async_trait::async_trait;
use pushhub_core::config::RedisConfig;
use pushhub_core::{Notification, UserId};
use std::sync::Arc;
use tracing::info;

use super::redis_pubsub::RedisBroker;
use crate::Result;

/// Invoked once per envelope received from another instance
pub type MessageCallback = Arc<dyn Fn(UserId, Notification) + Send + Sync>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Best-effort send to every other subscribed instance.
    ///
    /// Fails only on local problems (serialization, transport unavailable);
    /// never waits for a remote acknowledgement.
    async fn publish_message(&self, user_id: UserId, notification: &Notification) -> Result<()>;

    /// Start receiving. `callback` runs once per envelope, in arrival order,
    /// until the broker is closed. Fails only if the initial handshake fails.
    async fn subscribe(&self, callback: MessageCallback) -> Result<()>;

    /// Stop receiving and release the transport. Idempotent, and fine to call
    /// without a prior `subscribe`.
    async fn close(&self) -> Result<()>;

    /// Whether messages actually reach other instances.
    fn is_distributed(&self) -> bool {
        true
    }
}

/// Broker for single-instance deployments: every operation succeeds and
/// nothing is ever delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroker;

#[async_trait]
impl MessageBroker for NoopBroker {
    async fn publish_message(&self, _user_id: UserId, _notification: &Notification) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _callback: MessageCallback) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

/// Build the broker selected by `config`.
pub async fn connect_broker(
    config: &RedisConfig,
    node_id: impl Into<String>,
) -> Result<Arc<dyn MessageBroker>> {
    if !config.enabled {
        info!("Redis disabled, running with the no-op broker");
        return Ok(Arc::new(NoopBroker));
    }
    let broker = RedisBroker::connect(config, node_id).await?;
    Ok(Arc::new(broker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_noop_broker_never_errors_and_never_calls_back() {
        let broker = NoopBroker;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let callback: MessageCallback = Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        broker.close().await.unwrap();
        broker.subscribe(callback.clone()).await.unwrap();
        broker.subscribe(callback).await.unwrap();
        for i in 0..10 {
            broker
                .publish_message(UserId::new(i), &Notification::new(1, "x"))
                .await
                .unwrap();
        }
        broker.close().await.unwrap();
        broker.close().await.unwrap();

        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_config_selects_noop() {
        let config = RedisConfig {
            enabled: false,
            url: "redis://127.0.0.1:1".to_string(),
            ..RedisConfig::default()
        };
        let broker = connect_broker(&config, "node-a").await.unwrap();
        broker
            .publish_message(UserId::new(1), &Notification::new(1, "x"))
            .await
            .unwrap();
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_enabled_config_with_unreachable_redis_fails() {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:1".to_string(),
            timeout_seconds: 1,
            ..RedisConfig::default()
        };
        assert!(connect_broker(&config, "node-a").await.is_err());
    }
}
