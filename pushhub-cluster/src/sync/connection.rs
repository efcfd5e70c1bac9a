//! One live client socket and its keepalive protocol
//!
//! A [`Connection`] owns a capacity-1 outbound queue and a shutdown token that
//! stands in for the socket. Two loops ride on it: the read loop only watches
//! for pongs to prove the peer is alive, the write loop drains the queue and
//! sends probes. Whichever side fails first closes the whole connection.
//!
//! Shutdown has two entry points. [`Connection::close`] is used by the hub,
//! which already holds its registry lock and removes the entry itself.
//! [`Connection::close_self`] is used by the loops and afterwards runs the
//! removal callback handed in at construction. Both run the close action
//! exactly once between them.

use parking_lot::Mutex;
use pushhub_core::config::StreamConfig;
use pushhub_core::{ClientToken, Notification, UserId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::transport::{FrameReader, FrameWriter, InboundFrame};

/// Outbound queue depth per connection
pub const OUTBOUND_CAPACITY: usize = 1;

/// Handle for a client connection
pub type ConnectionId = String;

/// Receiving end of a connection's outbound queue, drained by the write loop
pub type Outbound = mpsc::Receiver<Notification>;

type OnClose = Box<dyn FnOnce(&Connection) + Send + 'static>;

/// Keepalive timings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveSettings {
    /// Interval between pings
    pub ping_period: Duration,
    /// Extra time a peer gets to answer before it is considered dead
    pub pong_timeout: Duration,
    /// Deadline for a single frame write
    pub write_timeout: Duration,
}

impl KeepaliveSettings {
    /// How long the read loop waits for the next pong
    #[must_use]
    pub fn read_deadline(&self) -> Duration {
        self.ping_period + self.pong_timeout
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(45),
            pong_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&StreamConfig> for KeepaliveSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            ping_period: config.ping_period(),
            pong_timeout: config.pong_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// One-shot guard for a close action.
///
/// The flag is flipped with a compare-and-swap, so no lock is held while the
/// action runs and a concurrent caller sees "already closed" immediately.
#[derive(Debug, Default)]
pub struct CloseOnce {
    done: AtomicBool,
}

impl CloseOnce {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Run `action` if nobody has yet. Returns whether this call ran it.
    pub fn run<F: FnOnce()>(&self, action: F) -> bool {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        action();
        true
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Result of handing a notification to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queue full; the notification was dropped for this connection only
    Dropped,
    Closed,
}

/// Server-side state of one client socket
pub struct Connection {
    id: ConnectionId,
    user_id: UserId,
    token: ClientToken,
    connected_at: std::time::Instant,
    outbound: Mutex<Option<mpsc::Sender<Notification>>>,
    shutdown: CancellationToken,
    close_once: CloseOnce,
    on_close: Mutex<Option<OnClose>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection for an authenticated client.
    ///
    /// `on_close` runs once, after a self-initiated close, and is expected to
    /// remove the connection from whatever registry holds it.
    pub fn new<F>(user_id: UserId, token: ClientToken, on_close: F) -> (Arc<Self>, Outbound)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let connection = Arc::new(Self {
            id: nanoid::nanoid!(16),
            user_id,
            token,
            connected_at: std::time::Instant::now(),
            outbound: Mutex::new(Some(tx)),
            shutdown: CancellationToken::new(),
            close_once: CloseOnce::new(),
            on_close: Mutex::new(Some(Box::new(on_close))),
        });
        (connection, rx)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub const fn token(&self) -> &ClientToken {
        &self.token
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_once.is_done()
    }

    /// Non-blocking hand-off to the outbound queue.
    ///
    /// A full queue means the client has not drained the previous message;
    /// the new one is dropped for this connection rather than stalling the
    /// caller.
    pub fn enqueue(&self, notification: &Notification) -> EnqueueOutcome {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return EnqueueOutcome::Closed;
        };
        match tx.try_send(notification.clone()) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(TrySendError::Full(_)) => EnqueueOutcome::Dropped,
            Err(TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Hub-initiated close. Does not run the removal callback.
    ///
    /// Returns whether this call performed the close.
    pub fn close(&self) -> bool {
        let closed = self.close_once.run(|| self.release());
        if closed {
            debug!(
                connection_id = %self.id,
                user_id = %self.user_id,
                "Connection closed by hub"
            );
            // The hub removes the entry itself; drop the callback so it cannot fire.
            drop(self.on_close.lock().take());
        }
        closed
    }

    /// Self-initiated close after a read/write failure.
    ///
    /// Runs the removal callback if this call performed the close.
    pub fn close_self(&self, reason: &str) -> bool {
        let closed = self.close_once.run(|| self.release());
        if closed {
            info!(
                connection_id = %self.id,
                user_id = %self.user_id,
                reason = reason,
                duration = ?self.duration(),
                "Connection closed"
            );
            let callback = self.on_close.lock().take();
            if let Some(callback) = callback {
                callback(self);
            }
        }
        closed
    }

    fn release(&self) {
        self.shutdown.cancel();
        drop(self.outbound.lock().take());
    }

    /// Run both keepalive loops until the connection dies.
    ///
    /// The write loop is spawned; the read loop runs in the caller's task.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        outbound: Outbound,
        settings: KeepaliveSettings,
    ) where
        R: FrameReader + 'static,
        W: FrameWriter + 'static,
    {
        let write_side = self.clone();
        let write_task = tokio::spawn(async move {
            write_side.write_loop(writer, outbound, settings).await;
        });

        self.read_loop(reader, settings).await;

        if let Err(e) = write_task.await {
            warn!(
                connection_id = %self.id,
                error = %e,
                "Write loop ended abnormally"
            );
            self.close_self("write loop panicked");
        }
    }

    async fn read_loop<R: FrameReader>(&self, mut reader: R, settings: KeepaliveSettings) {
        let mut deadline = Instant::now() + settings.read_deadline();

        let reason = loop {
            let frame = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                frame = tokio::time::timeout_at(deadline, reader.next_frame()) => frame,
            };

            match frame {
                Err(_) => break "pong not received in time",
                Ok(None) => break "stream ended",
                Ok(Some(Err(e))) => {
                    debug!(connection_id = %self.id, error = %e, "Read failed");
                    break "read error";
                }
                Ok(Some(Ok(InboundFrame::Pong))) => {
                    deadline = Instant::now() + settings.read_deadline();
                }
                Ok(Some(Ok(InboundFrame::Data))) => {
                    trace!(connection_id = %self.id, "Discarding client data frame");
                }
                Ok(Some(Ok(InboundFrame::Close))) => break "closed by peer",
            }
        };

        self.close_self(reason);
    }

    async fn write_loop<W: FrameWriter>(
        &self,
        mut writer: W,
        mut outbound: Outbound,
        settings: KeepaliveSettings,
    ) {
        let mut ping = tokio::time::interval_at(
            Instant::now() + settings.ping_period,
            settings.ping_period,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let failure = loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break None,
                message = outbound.recv() => {
                    let Some(message) = message else { break None };
                    match timeout(settings.write_timeout, writer.send_notification(&message)).await {
                        Ok(Ok(())) => {
                            trace!(connection_id = %self.id, id = message.id, "Notification written");
                        }
                        Ok(Err(e)) => {
                            debug!(connection_id = %self.id, error = %e, "Notification write failed");
                            break Some("write error");
                        }
                        Err(_) => break Some("write timed out"),
                    }
                }
                _ = ping.tick() => {
                    match timeout(settings.write_timeout, writer.send_ping()).await {
                        Ok(Ok(())) => trace!(connection_id = %self.id, "Ping sent"),
                        Ok(Err(e)) => {
                            debug!(connection_id = %self.id, error = %e, "Ping write failed");
                            break Some("ping failed");
                        }
                        Err(_) => break Some("ping timed out"),
                    }
                }
            }
        };

        if let Some(reason) = failure {
            self.close_self(reason);
        }

        // Best effort; the peer may already be gone.
        if let Ok(Err(e)) = timeout(settings.write_timeout, writer.close()).await {
            trace!(connection_id = %self.id, error = %e, "Close frame not delivered");
        }
    }
}
