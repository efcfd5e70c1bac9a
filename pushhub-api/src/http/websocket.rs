//! Notification stream endpoint
//!
//! `GET /stream` upgrades an authenticated client to a WebSocket and hands
//! both halves to a [`Connection`], which runs the keepalive protocol and
//! writes every notification queued for the client's user as one JSON text
//! frame. The socket is push-only: anything the client sends besides pongs
//! and close frames is discarded.

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use pushhub_cluster::sync::{FrameReader, FrameWriter, InboundFrame};
use pushhub_cluster::{Connection, Error as ClusterError, Result as ClusterResult};
use pushhub_core::{Notification, Principal};
use tracing::{debug, info, trace, warn};

use super::middleware::AuthUser;
use super::{AppError, AppResult, AppState};

/// Largest inbound frame accepted; clients are not expected to send data
const MAX_INBOUND_MESSAGE_SIZE: usize = 4 * 1024;

/// Upgrade handler for the notification stream
///
/// Clients authenticate with their client token, via the `X-Pushhub-Key`
/// header, a `token` query parameter or a bearer token:
/// `ws://host/stream?token={client_token}`
pub async fn stream_handler(
    State(state): State<AppState>,
    AuthUser(principal): AuthUser,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> AppResult<Response> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !state.origin_policy.is_allowed(origin, host) {
        warn!(
            user_id = %principal.user_id,
            origin = origin.unwrap_or_default(),
            "Rejected stream upgrade from disallowed origin"
        );
        return Err(AppError::forbidden("Origin not allowed"));
    }

    // Full or draining servers answer 429/503 instead of upgrading
    if let Err(e) = state.hub().check_capacity(principal.user_id) {
        debug!(user_id = %principal.user_id, error = %e, "Stream upgrade refused");
        return Err(e.into());
    }

    // Plain HTTP requests get the upgrade rejection (a client error) as is
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(user_id = %principal.user_id, "Stream request is not a WebSocket upgrade");
            return Ok(rejection.into_response());
        }
    };

    Ok(ws
        .max_message_size(MAX_INBOUND_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, principal)))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let hub = state.hub().clone();
    let (connection, outbound) =
        Connection::new(principal.user_id, principal.token, hub.deregister_on_close());

    let (sink, stream) = socket.split();
    let mut writer = WsWriter(sink);

    if let Err(e) = hub.register(connection.clone()) {
        warn!(
            user_id = %connection.user_id(),
            error = %e,
            "Stream connection rejected"
        );
        connection.close();
        if let Err(e) = writer.close().await {
            trace!(error = %e, "Failed to close rejected stream");
        }
        return;
    }

    info!(
        user_id = %connection.user_id(),
        connection_id = %connection.id(),
        "Stream connection established"
    );

    connection
        .serve(WsReader(stream), writer, outbound, state.keepalive)
        .await;
}

/// Read half of an axum WebSocket
struct WsReader(SplitStream<WebSocket>);

#[async_trait]
impl FrameReader for WsReader {
    async fn next_frame(&mut self) -> Option<ClusterResult<InboundFrame>> {
        let frame = match self.0.next().await? {
            Ok(Message::Pong(_)) => InboundFrame::Pong,
            Ok(Message::Close(_)) => InboundFrame::Close,
            // Client pings are answered by the WebSocket layer
            Ok(Message::Ping(_) | Message::Text(_) | Message::Binary(_)) => InboundFrame::Data,
            Err(e) => return Some(Err(ClusterError::Transport(e.to_string()))),
        };
        Some(Ok(frame))
    }
}

/// Write half of an axum WebSocket
struct WsWriter(SplitSink<WebSocket, Message>);

impl WsWriter {
    async fn send(&mut self, message: Message) -> ClusterResult<()> {
        self.0
            .send(message)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send_notification(&mut self, notification: &Notification) -> ClusterResult<()> {
        let json = serde_json::to_string(notification)?;
        self.send(Message::Text(json.into())).await
    }

    async fn send_ping(&mut self) -> ClusterResult<()> {
        self.send(Message::Ping(Bytes::new())).await
    }

    async fn close(&mut self) -> ClusterResult<()> {
        self.send(Message::Close(None)).await?;
        SinkExt::close(&mut self.0)
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))
    }
}
