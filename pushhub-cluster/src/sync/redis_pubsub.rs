use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use pushhub_core::config::RedisConfig;
use pushhub_core::metrics::{BROKER_DECODE_ERRORS, BROKER_MESSAGES};
use pushhub_core::{Notification, UserId};
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client as RedisClient};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broker::{MessageBroker, MessageCallback};
use super::events::Envelope;
use crate::{Error, Result};

/// Redis pub/sub broker for multi-instance deployments
///
/// Every instance publishes on, and subscribes to, one channel
/// (`{channel_prefix}{channel}`). Envelopes carry the publishing node's id so
/// the subscriber can skip its own traffic; the local hub has already
/// delivered those.
///
/// Construction verifies that Redis is reachable and fails fast otherwise.
/// A dropped subscription is re-established with exponential backoff.
pub struct RedisBroker {
    client: RedisClient,
    publisher: Mutex<Option<ConnectionManager>>,
    channel: String,
    node_id: String,
    op_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    cancel_token: CancellationToken,
    subscribed: AtomicBool,
    subscriber_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("channel", &self.channel)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to Redis and check it answers `PING`.
    ///
    /// Nothing is spawned until [`MessageBroker::subscribe`] is called, so a
    /// failure here leaves no background work behind.
    pub async fn connect(config: &RedisConfig, node_id: impl Into<String>) -> Result<Self> {
        let op_timeout = Duration::from_secs(config.timeout_seconds);
        let client = RedisClient::open(config.url.as_str())?;

        let mut conn = with_timeout(
            op_timeout,
            "connecting to Redis",
            client.get_multiplexed_async_connection(),
        )
        .await?;
        let pong: String = with_timeout(
            op_timeout,
            "pinging Redis",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        debug!(response = %pong, "Redis reachable");

        let publisher = with_timeout(
            op_timeout,
            "creating Redis connection manager",
            client.get_connection_manager(),
        )
        .await?;

        let broker = Self {
            client,
            publisher: Mutex::new(Some(publisher)),
            channel: config.channel_name(),
            node_id: node_id.into(),
            op_timeout,
            initial_backoff: Duration::from_secs(config.reconnect_initial_backoff_seconds),
            max_backoff: Duration::from_secs(config.reconnect_max_backoff_seconds),
            cancel_token: CancellationToken::new(),
            subscribed: AtomicBool::new(false),
            subscriber_task: Mutex::new(None),
        };
        info!(
            channel = %broker.channel,
            node_id = %broker.node_id,
            "Redis broker connected"
        );
        Ok(broker)
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish_message(&self, user_id: UserId, notification: &Notification) -> Result<()> {
        let payload = Envelope::new(user_id, notification.clone(), self.node_id.as_str()).encode()?;

        // Cloned out so the lock is not held across the await
        let mut conn = self
            .publisher
            .lock()
            .clone()
            .ok_or_else(|| Error::Closed("broker is closed".to_string()))?;

        let receivers: usize = with_timeout(
            self.op_timeout,
            "publishing to Redis",
            conn.publish(&self.channel, &payload),
        )
        .await?;

        BROKER_MESSAGES.with_label_values(&["published"]).inc();
        debug!(
            channel = %self.channel,
            user_id = %user_id,
            receivers,
            "Notification published"
        );
        Ok(())
    }

    async fn subscribe(&self, callback: MessageCallback) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed("broker is closed".to_string()));
        }
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadySubscribed);
        }

        let pubsub = match open_subscription(&self.client, &self.channel, self.op_timeout).await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                self.subscribed.store(false, Ordering::Release);
                return Err(e);
            }
        };
        info!(channel = %self.channel, "Redis subscriber connected");

        let worker = SubscriberWorker {
            client: self.client.clone(),
            channel: self.channel.clone(),
            node_id: self.node_id.clone(),
            op_timeout: self.op_timeout,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            cancel_token: self.cancel_token.clone(),
            callback,
        };

        // close() cancels before taking the task: it either finds this handle or we see the cancel
        let mut task = self.subscriber_task.lock();
        if self.cancel_token.is_cancelled() {
            return Err(Error::Closed("broker closed while subscribing".to_string()));
        }
        *task = Some(tokio::spawn(worker.run(pubsub)));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Cancel first: the subscriber unsubscribes and drops its connection on the way out
        self.cancel_token.cancel();

        let task = self.subscriber_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Redis subscriber task ended abnormally");
            }
        }

        if self.publisher.lock().take().is_some() {
            info!(channel = %self.channel, "Redis broker closed");
        }
        Ok(())
    }
}

/// Why a subscription's message stream stopped
enum SubscriberExit {
    Cancelled,
    /// Redis dropped the connection after it had been healthy
    Disconnected,
}

/// What happened to one received payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    SelfOriginated,
    Malformed,
}

struct SubscriberWorker {
    client: RedisClient,
    channel: String,
    node_id: String,
    op_timeout: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    cancel_token: CancellationToken,
    callback: MessageCallback,
}

impl SubscriberWorker {
    async fn run(self, mut pubsub: PubSub) {
        loop {
            match self.pump(&mut pubsub).await {
                SubscriberExit::Cancelled => {
                    if let Err(e) = with_timeout(
                        self.op_timeout,
                        "unsubscribing",
                        pubsub.unsubscribe(self.channel.as_str()),
                    )
                    .await
                    {
                        debug!(error = %e, "Unsubscribe failed during shutdown");
                    }
                    info!(channel = %self.channel, "Redis subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    error!(
                        channel = %self.channel,
                        "Redis subscriber stream ended (connection lost), reconnecting"
                    );
                }
            }

            // Each outage starts over from the shortest delay
            let mut backoff = self.initial_backoff;
            pubsub = loop {
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        info!("Redis subscriber task cancelled during backoff");
                        return;
                    }
                    () = tokio::time::sleep(backoff) => {}
                }

                match open_subscription(&self.client, &self.channel, self.op_timeout).await {
                    Ok(pubsub) => {
                        info!(channel = %self.channel, "Redis subscriber reconnected");
                        break pubsub;
                    }
                    Err(e) => {
                        error!(
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "Redis subscriber failed to reconnect, retrying after backoff"
                        );
                        backoff = next_backoff(backoff, self.max_backoff);
                    }
                }
            };
        }
    }

    async fn pump(&self, pubsub: &mut PubSub) -> SubscriberExit {
        let mut stream = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return SubscriberExit::Cancelled,
                msg = stream.next() => msg,
            };
            let Some(msg) = msg else {
                return SubscriberExit::Disconnected;
            };

            match msg.get_payload::<String>() {
                Ok(payload) => {
                    dispatch_payload(&self.node_id, &payload, &self.callback);
                }
                Err(e) => {
                    BROKER_DECODE_ERRORS.inc();
                    warn!(error = %e, channel = %self.channel, "Invalid payload");
                }
            }
        }
    }
}

/// Decode one payload and hand it to `callback` unless it is ours or malformed.
///
/// Malformed payloads are logged and dropped; they never stop the loop.
pub(crate) fn dispatch_payload(
    node_id: &str,
    payload: &str,
    callback: &MessageCallback,
) -> DispatchOutcome {
    let envelope = match Envelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            BROKER_DECODE_ERRORS.inc();
            warn!(
                error = %e,
                payload_len = payload.len(),
                payload = payload_preview(payload),
                "Failed to deserialize envelope"
            );
            return DispatchOutcome::Malformed;
        }
    };

    if envelope.is_from(node_id) {
        debug!(node_id = %node_id, "Ignoring envelope from self");
        return DispatchOutcome::SelfOriginated;
    }

    BROKER_MESSAGES.with_label_values(&["received"]).inc();
    callback(envelope.user_id, envelope.message);
    DispatchOutcome::Delivered
}

/// Longest payload prefix written to the log
const LOGGED_PAYLOAD_PREFIX: usize = 128;

/// At most [`LOGGED_PAYLOAD_PREFIX`] bytes of `payload`, cut on a char boundary.
fn payload_preview(payload: &str) -> &str {
    if payload.len() <= LOGGED_PAYLOAD_PREFIX {
        return payload;
    }
    let mut end = LOGGED_PAYLOAD_PREFIX;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    &payload[..end]
}

async fn open_subscription(
    client: &RedisClient,
    channel: &str,
    op_timeout: Duration,
) -> Result<PubSub> {
    let mut pubsub = with_timeout(
        op_timeout,
        "opening Redis pub/sub connection",
        client.get_async_pubsub(),
    )
    .await?;
    with_timeout(op_timeout, "subscribing", pubsub.subscribe(channel)).await?;
    Ok(pubsub)
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Timeout(format!("timed out {what}"))),
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn recording_callback() -> (MessageCallback, mpsc::UnboundedReceiver<(UserId, Notification)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: MessageCallback = Arc::new(move |user_id, notification| {
            let _ = tx.send((user_id, notification));
        });
        (callback, rx)
    }

    fn test_config(prefix: &str) -> RedisConfig {
        RedisConfig {
            enabled: true,
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            channel_prefix: format!("pushhub-test:{prefix}:"),
            ..RedisConfig::default()
        }
    }

    #[test]
    fn test_malformed_payload_does_not_block_next_one() {
        let (callback, mut rx) = recording_callback();
        let good = Envelope::new(UserId::new(7), Notification::new(1, "after"), "node-b")
            .encode()
            .unwrap();

        assert_eq!(
            dispatch_payload("node-a", "{\"userID\": oops", &callback),
            DispatchOutcome::Malformed
        );
        assert_eq!(
            dispatch_payload("node-a", &good, &callback),
            DispatchOutcome::Delivered
        );

        let (user_id, notification) = rx.try_recv().unwrap();
        assert_eq!(user_id, UserId::new(7));
        assert_eq!(notification.message, "after");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_self_originated_envelope_is_skipped() {
        let (callback, mut rx) = recording_callback();
        let own = Envelope::new(UserId::new(1), Notification::new(1, "mine"), "node-a")
            .encode()
            .unwrap();

        assert_eq!(
            dispatch_payload("node-a", &own, &callback),
            DispatchOutcome::SelfOriginated
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_payload_preview_is_bounded() {
        assert_eq!(payload_preview("short"), "short");

        let huge = "x".repeat(10 * 1024);
        assert_eq!(payload_preview(&huge).len(), LOGGED_PAYLOAD_PREFIX);

        // Never splits a multi-byte character
        let wide = "é".repeat(LOGGED_PAYLOAD_PREFIX);
        let preview = payload_preview(&wide);
        assert!(preview.len() <= LOGGED_PAYLOAD_PREFIX);
        assert!(preview.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        let mut backoff = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_redis_fails() {
        let config = RedisConfig {
            enabled: true,
            url: "redis://127.0.0.1:1".to_string(),
            timeout_seconds: 1,
            ..RedisConfig::default()
        };
        let result = RedisBroker::connect(&config, "node-a").await;
        assert!(matches!(result, Err(Error::Redis(_) | Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_with_invalid_url_fails() {
        let config = RedisConfig {
            enabled: true,
            url: "not a url".to_string(),
            ..RedisConfig::default()
        };
        assert!(RedisBroker::connect(&config, "node-a").await.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_round_trip_between_nodes() {
        let config = test_config(&nanoid::nanoid!(8));
        let node_a = RedisBroker::connect(&config, "node-a").await.unwrap();
        let node_b = RedisBroker::connect(&config, "node-b").await.unwrap();

        let (callback_a, mut received_a) = recording_callback();
        let (callback_b, mut received_b) = recording_callback();
        node_a.subscribe(callback_a).await.unwrap();
        node_b.subscribe(callback_b).await.unwrap();

        let notification = Notification::new(3, "cross-node").with_title("hi");
        node_a
            .publish_message(UserId::new(7), &notification)
            .await
            .unwrap();

        let (user_id, received) = timeout(Duration::from_secs(5), received_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_id, UserId::new(7));
        assert_eq!(received, notification);

        // The publisher does not hear its own message
        assert!(timeout(Duration::from_millis(300), received_a.recv()).await.is_err());

        node_a.close().await.unwrap();
        node_b.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_malformed_payload_on_channel_is_skipped() {
        let config = test_config(&nanoid::nanoid!(8));
        let node = RedisBroker::connect(&config, "node-a").await.unwrap();
        let (callback, mut received) = recording_callback();
        node.subscribe(callback).await.unwrap();

        let client = RedisClient::open(config.url.as_str()).unwrap();
        let mut raw = client.get_multiplexed_async_connection().await.unwrap();
        let _: usize = raw.publish(config.channel_name(), "garbage").await.unwrap();
        let good = Envelope::new(UserId::new(2), Notification::new(1, "ok"), "node-z")
            .encode()
            .unwrap();
        let _: usize = raw.publish(config.channel_name(), good).await.unwrap();

        let (user_id, notification) = timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user_id, UserId::new(2));
        assert_eq!(notification.message, "ok");

        node.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_subscribe_twice_and_close_semantics() {
        let config = test_config(&nanoid::nanoid!(8));
        let node = RedisBroker::connect(&config, "node-a").await.unwrap();

        // Close without subscribe is fine, and idempotent
        let never = RedisBroker::connect(&config, "node-b").await.unwrap();
        never.close().await.unwrap();
        never.close().await.unwrap();

        let (callback, _rx) = recording_callback();
        node.subscribe(callback.clone()).await.unwrap();
        assert!(matches!(
            node.subscribe(callback).await,
            Err(Error::AlreadySubscribed)
        ));

        node.close().await.unwrap();
        node.close().await.unwrap();
        assert!(matches!(
            node.publish_message(UserId::new(1), &Notification::new(1, "x")).await,
            Err(Error::Closed(_))
        ));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_close_during_subscribe_leaves_no_worker() {
        let config = test_config(&nanoid::nanoid!(8));
        let node = RedisBroker::connect(&config, "node-a").await.unwrap();
        let (callback, _rx) = recording_callback();

        // subscribe is polled first and parks on the Redis round trip; close runs meanwhile
        let (subscribed, closed) = tokio::join!(node.subscribe(callback), node.close());

        closed.unwrap();
        assert!(matches!(subscribed, Err(Error::Closed(_))));
        assert!(node.subscriber_task.lock().is_none());
    }
}
