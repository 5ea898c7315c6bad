//! In-process relay connections.
//!
//! [`connect_local`] runs a real `RelaySession` and `ConnectionActor` against
//! plain channels instead of a socket. Behaviour is identical to a WebSocket
//! client, which makes it the deterministic transport for tests.

use crate::actors::ConnectionActor;
use crate::errors::RelayError;

use super::session::RelaySession;
use super::transport::ChannelFrameSink;
use super::{Inbound, RelayContext};

use common::protocol::{ServerFrame, SignalEnvelope};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Client end of an in-process relay connection.
///
/// Dropping it behaves like the network going away: the relay starts the
/// disconnect grace period for the joined peer.
#[derive(Debug)]
pub struct LocalConnection {
    connection_id: String,
    inbound: Option<mpsc::Sender<Inbound>>,
    frames: mpsc::Receiver<ServerFrame>,
    close_rx: Option<oneshot::Receiver<(u16, String)>>,
    close_frame: Option<(u16, String)>,
    session: Option<JoinHandle<()>>,
}

/// Open an in-process connection to the relay described by `ctx`.
#[must_use]
pub fn connect_local(ctx: &RelayContext) -> LocalConnection {
    let connection_id = Uuid::new_v4().to_string();
    let capacity = ctx.settings.connection.mailbox_capacity.max(1);

    let (frames_tx, frames_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = oneshot::channel();
    let sink = ChannelFrameSink::new(frames_tx).with_close_notifier(close_tx);

    let (connection, _task) = ConnectionActor::spawn(
        connection_id.clone(),
        sink,
        ctx.shutdown.child_token(),
        ctx.settings.connection,
        Arc::clone(&ctx.metrics),
    );

    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let session = tokio::spawn(RelaySession::new(ctx.clone(), connection).run(inbound_rx));

    LocalConnection {
        connection_id,
        inbound: Some(inbound_tx),
        frames: frames_rx,
        close_rx: Some(close_rx),
        close_frame: None,
        session: Some(session),
    }
}

impl LocalConnection {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Send one envelope as a text frame.
    pub async fn send(&self, envelope: &SignalEnvelope) -> Result<(), RelayError> {
        let text = envelope.to_json()?;
        self.send_text(text).await
    }

    /// Send a raw text frame, valid or not.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), RelayError> {
        self.send_event(Inbound::Text(text.into())).await
    }

    /// Transport-level liveness without a relay frame.
    pub async fn ping(&self) -> Result<(), RelayError> {
        self.send_event(Inbound::Activity).await
    }

    async fn send_event(&self, event: Inbound) -> Result<(), RelayError> {
        let Some(inbound) = &self.inbound else {
            return Err(RelayError::RelayUnavailable("connection closed".to_string()));
        };
        inbound
            .send(event)
            .await
            .map_err(|_| RelayError::RelayUnavailable("connection closed".to_string()))
    }

    /// Next frame from the relay, or `None` once the relay closed the connection.
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.frames.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.frames.try_recv().ok()
    }

    /// Close code and reason sent by the relay, once it has closed the connection.
    pub fn close_frame(&mut self) -> Option<(u16, String)> {
        if self.close_frame.is_none() {
            if let Some(rx) = self.close_rx.as_mut() {
                if let Ok(frame) = rx.try_recv() {
                    self.close_frame = Some(frame);
                    self.close_rx = None;
                }
            }
        }
        self.close_frame.clone()
    }

    /// Drop the connection without a `leave-stream` and wait until the relay
    /// has registered the loss.
    pub async fn disconnect(mut self) {
        if let Some(inbound) = self.inbound.take() {
            let _ = inbound.send(Inbound::Closed).await;
        }
        if let Some(session) = self.session.take() {
            let _ = session.await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, ConnectionSettings, SessionRegistry, StreamSettings};
    use crate::relay::RelaySettings;
    use crate::store::{InMemorySignalStore, StreamDirectory};
    use common::protocol::{ControlFrame, ErrorCode, SignalType, CLOSE_JOIN_REQUIRED};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn context() -> RelayContext {
        let store = Arc::new(InMemorySignalStore::new());
        let metrics = ActorMetrics::new();
        let registry = SessionRegistry::spawn(
            "local-test".to_string(),
            Arc::new(StreamDirectory::new()),
            store.clone(),
            StreamSettings {
                grace_period: Duration::from_secs(30),
                store_timeout: Duration::from_secs(1),
            },
            Arc::clone(&metrics),
        );
        RelayContext {
            registry,
            store,
            settings: RelaySettings {
                heartbeat_timeout: Duration::from_secs(45),
                store_timeout: Duration::from_secs(1),
                offer_replay_limit: 10,
                connection: ConnectionSettings {
                    mailbox_capacity: 32,
                    send_timeout: Duration::from_secs(1),
                },
            },
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_before_join_is_acked() {
        let ctx = context();
        let mut conn = connect_local(&ctx);

        conn.send(&SignalEnvelope::new(SignalType::Heartbeat, "s1", "l1"))
            .await
            .unwrap();
        let frame = conn.recv().await.unwrap();
        assert_eq!(frame, ServerFrame::Control(ControlFrame::HeartbeatAck));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_join() {
        let ctx = context();
        let mut conn = connect_local(&ctx);

        let offer = SignalEnvelope::new(SignalType::Offer, "s1", "b1")
            .with_data(serde_json::json!({"sdp": "v=0"}));
        conn.send(&offer).await.unwrap();

        match conn.recv().await.unwrap() {
            ServerFrame::Control(ControlFrame::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::JoinRequired);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(conn.recv().await.is_none());
        assert_eq!(conn.close_frame().unwrap().0, CLOSE_JOIN_REQUIRED);
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let ctx = context();
        let mut conn = connect_local(&ctx);

        conn.send_text("{not json").await.unwrap();
        match conn.recv().await.unwrap() {
            ServerFrame::Control(ControlFrame::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::ValidationError);
            }
            other => panic!("unexpected frame {other:?}"),
        }

        conn.send(&SignalEnvelope::new(SignalType::Heartbeat, "s1", "l1"))
            .await
            .unwrap();
        assert_eq!(conn.recv().await.unwrap().kind(), "heartbeat-ack");
    }

    #[tokio::test]
    async fn test_join_unknown_stream_rejected_without_close() {
        let ctx = context();
        let mut conn = connect_local(&ctx);

        conn.send(&SignalEnvelope::new(SignalType::JoinStream, "missing", "l1"))
            .await
            .unwrap();
        match conn.recv().await.unwrap() {
            ServerFrame::Control(ControlFrame::Error { code, .. }) => {
                assert_eq!(code, ErrorCode::StreamNotActive);
            }
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(conn.close_frame().is_none());
    }
}
