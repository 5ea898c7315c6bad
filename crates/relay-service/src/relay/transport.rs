//! Transport adapters.
//!
//! A transport is split in two: the outbound half becomes a [`FrameSink`]
//! owned by a `ConnectionActor`, the inbound half is pumped into
//! [`Inbound`] events for the `RelaySession`.

use crate::actors::{ConnectionActor, FrameSink};
use crate::errors::RelayError;

use super::session::RelaySession;
use super::{Inbound, RelayContext};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use common::protocol::ServerFrame;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Inbound events buffered between the socket reader and the session.
const INBOUND_BUFFER: usize = 64;

/// Outbound half of an axum WebSocket.
pub struct WsFrameSink {
    sink: SplitSink<WebSocket, Message>,
}

impl WsFrameSink {
    #[must_use]
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), RelayError> {
        let text = frame
            .to_json()
            .map_err(|e| RelayError::Internal(format!("frame encode failed: {e}")))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| RelayError::RelayUnavailable(format!("socket write failed: {e}")))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

/// Outbound half of an in-process connection.
///
/// Frames go to an `mpsc` receiver; the close code, if any, is reported once
/// through an optional notifier before the frame channel is dropped.
pub struct ChannelFrameSink {
    frames: Option<mpsc::Sender<ServerFrame>>,
    on_close: Option<oneshot::Sender<(u16, String)>>,
}

impl ChannelFrameSink {
    #[must_use]
    pub fn new(frames: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            frames: Some(frames),
            on_close: None,
        }
    }

    /// Report the close code to `notifier` when the relay closes the connection.
    #[must_use]
    pub fn with_close_notifier(mut self, notifier: oneshot::Sender<(u16, String)>) -> Self {
        self.on_close = Some(notifier);
        self
    }
}

#[async_trait]
impl FrameSink for ChannelFrameSink {
    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), RelayError> {
        let Some(frames) = &self.frames else {
            return Err(RelayError::RelayUnavailable("connection closed".to_string()));
        };
        frames
            .send(frame.clone())
            .await
            .map_err(|_| RelayError::RelayUnavailable("peer receiver dropped".to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if let Some(notifier) = self.on_close.take() {
            let _ = notifier.send((code, reason.to_string()));
        }
        self.frames = None;
    }
}

/// Run one relay connection over an upgraded WebSocket until it ends.
pub async fn serve_websocket(socket: WebSocket, ctx: RelayContext) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();

    let (connection, _task) = ConnectionActor::spawn(
        connection_id.clone(),
        WsFrameSink::new(sink),
        ctx.shutdown.child_token(),
        ctx.settings.connection,
        Arc::clone(&ctx.metrics),
    );

    info!(
        target: "relay.session",
        connection_id = %connection_id,
        "Relay connection accepted"
    );

    let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let event = match message {
                Ok(Message::Text(text)) => Inbound::Text(text),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Inbound::Text(text),
                    Err(_) => Inbound::Activity,
                },
                Ok(Message::Ping(_) | Message::Pong(_)) => Inbound::Activity,
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    debug!(target: "relay.session", error = %e, "Socket read failed");
                    break;
                }
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
        let _ = tx.send(Inbound::Closed).await;
    });

    RelaySession::new(ctx, connection).run(rx).await;
    reader.abort();

    info!(
        target: "relay.session",
        connection_id = %connection_id,
        "Relay connection closed"
    );
}
