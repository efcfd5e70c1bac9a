//! Socket halves as seen by a [`Connection`](super::Connection)
//!
//! The keepalive protocol only needs three things from the socket: observe
//! pongs, write a notification, write a ping. Keeping that behind two traits
//! lets the same loops ride on an axum WebSocket in production and on
//! in-memory channels in tests.

use async_trait::async_trait;
use pushhub_core::Notification;

use crate::Result;

/// Frames a client can send that the protocol cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame {
    /// Answer to a liveness probe
    Pong,
    /// Any data frame; the server expects none and discards them
    Data,
    /// Close handshake initiated by the peer
    Close,
}

/// Read half of a client socket
#[async_trait]
pub trait FrameReader: Send {
    /// Next inbound frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame>>;
}

/// Write half of a client socket
#[async_trait]
pub trait FrameWriter: Send {
    /// Write one notification as a single data frame.
    async fn send_notification(&mut self, notification: &Notification) -> Result<()>;

    /// Write a liveness probe (native ping control frame).
    async fn send_ping(&mut self) -> Result<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<()>;
}
