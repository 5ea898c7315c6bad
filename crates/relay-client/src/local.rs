//! In-process signaling channel.
//!
//! Talks to a relay running in the same process through
//! `relay_service::relay::connect_local`. The relay side is the real
//! session state machine, so behaviour matches the WebSocket variant.

use crate::channel::{ChannelConnector, SignalingChannel};
use crate::errors::ClientError;

use async_trait::async_trait;
use common::protocol::{ServerFrame, SignalEnvelope};
use relay_service::relay::{connect_local, LocalConnection, RelayContext};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opens in-process channels to one relay.
pub struct LocalConnector {
    ctx: RelayContext,
    /// Cancelled to cut every open channel at once.
    network: Mutex<CancellationToken>,
    offline: AtomicBool,
    connects: AtomicUsize,
}

impl LocalConnector {
    #[must_use]
    pub fn new(ctx: RelayContext) -> Self {
        Self {
            ctx,
            network: Mutex::new(CancellationToken::new()),
            offline: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    /// Drop every open channel without a `leave-stream`, as a network
    /// failure would. New connections still succeed.
    pub async fn simulate_drop(&self) {
        let mut network = self.network.lock().await;
        network.cancel();
        *network = CancellationToken::new();
    }

    /// Refuse new connections while `offline` is true.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for LocalConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("network unreachable".to_string()));
        }
        let dropped = self.network.lock().await.child_token();
        let connection = connect_local(&self.ctx);
        self.connects.fetch_add(1, Ordering::SeqCst);

        debug!(
            target: "relay.client",
            connection_id = %connection.connection_id(),
            "Local channel opened"
        );
        Ok(Box::new(LocalChannel {
            connection: Some(connection),
            dropped,
        }))
    }
}

/// One in-process connection.
pub struct LocalChannel {
    connection: Option<LocalConnection>,
    dropped: CancellationToken,
}

impl LocalChannel {
    async fn cut(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.disconnect().await;
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), ClientError> {
        if self.dropped.is_cancelled() {
            self.cut().await;
        }
        let Some(connection) = &self.connection else {
            return Err(ClientError::Transport("connection dropped".to_string()));
        };
        connection
            .send(envelope)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, ClientError> {
        let Some(connection) = self.connection.as_mut() else {
            return Err(ClientError::Transport("connection dropped".to_string()));
        };

        tokio::select! {
            () = self.dropped.cancelled() => {}
            frame = connection.recv() => return Ok(frame),
        }
        self.cut().await;
        Err(ClientError::Transport("network dropped".to_string()))
    }

    fn close_code(&mut self) -> Option<u16> {
        self.connection
            .as_mut()
            .and_then(LocalConnection::close_frame)
            .map(|(code, _)| code)
    }

    async fn close(&mut self) {
        self.cut().await;
    }
}
