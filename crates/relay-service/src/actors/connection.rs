//! `ConnectionActor` - owns the outbound half of one relay connection.
//!
//! Each `ConnectionActor`:
//! - Serializes `ServerFrame`s onto exactly one transport (`FrameSink`)
//! - Accepts frames without blocking the sender (`try_send`); a full mailbox
//!   drops the frame for this peer only
//! - Bounds every write with a timeout and closes the transport if it stalls
//!
//! # Lifecycle
//!
//! 1. Spawned when a relay connection is accepted, before `join-stream`
//! 2. Runs until the transport fails, a `Close` is processed, or its token is cancelled
//! 3. Its token is a child of the server's shutdown token, never shared with other connections

use crate::errors::RelayError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use async_trait::async_trait;
use common::protocol::ServerFrame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Outbound half of a relay transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one frame.
    async fn send_frame(&mut self, frame: &ServerFrame) -> Result<(), RelayError>;

    /// Close the transport. Errors are swallowed; the peer may already be gone.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Tunables for a connection actor.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub mailbox_capacity: usize,
    pub send_timeout: Duration,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue a frame without waiting. Never blocks the caller.
    ///
    /// # Errors
    ///
    /// `RelayUnavailable` when the mailbox is full or the actor has stopped.
    pub fn send(&self, frame: ServerFrame) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        match self.sender.try_send(ConnectionMessage::Send { frame }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                Err(RelayError::RelayUnavailable(format!(
                    "connection {} mailbox full",
                    self.connection_id
                )))
            }
            Err(TrySendError::Closed(_)) => {
                self.mailbox.record_closed();
                Err(RelayError::RelayUnavailable(format!(
                    "connection {} closed",
                    self.connection_id
                )))
            }
        }
    }

    /// Ask the actor to close the transport after flushing queued frames.
    /// Falls back to cancellation when the mailbox is full.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let message = ConnectionMessage::Close {
            code,
            reason: reason.into(),
        };
        self.mailbox.record_enqueue();
        if self.sender.try_send(message).is_err() {
            self.mailbox.record_closed();
            self.cancel_token.cancel();
        }
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the actor has stopped or been cancelled.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S: FrameSink> {
    connection_id: String,
    sink: S,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    send_timeout: Duration,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    frames_sent: u64,
}

impl<S: FrameSink> ConnectionActor<S> {
    /// Spawn a new connection actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        sink: S,
        cancel_token: CancellationToken,
        settings: ConnectionSettings,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(settings.mailbox_capacity.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, &connection_id));

        metrics.connection_opened();

        let actor = Self {
            connection_id: connection_id.clone(),
            sink,
            receiver,
            cancel_token: cancel_token.clone(),
            send_timeout: settings.send_timeout,
            metrics,
            mailbox: Arc::clone(&mailbox),
            frames_sent: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "relay.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.sink.close(1001, "going away").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            "ConnectionActor channel closed, exiting"
                        );
                        self.sink.close(1000, "closed").await;
                        break;
                    };

                    self.mailbox.record_dequeue();
                    self.metrics.record_message_processed();
                    if self.handle_message(message).await {
                        break;
                    }
                }
            }
        }

        // Wake anyone waiting on `closed()`
        self.cancel_token.cancel();
        self.metrics.connection_closed();

        info!(
            target: "relay.actor.connection",
            connection_id = %self.connection_id,
            frames_sent = self.frames_sent,
            frames_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { frame } => {
                match tokio::time::timeout(self.send_timeout, self.sink.send_frame(&frame)).await {
                    Ok(Ok(())) => {
                        self.frames_sent += 1;
                        false
                    }
                    Ok(Err(e)) => {
                        warn!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            frame = frame.kind(),
                            error = %e,
                            "Transport write failed, closing connection"
                        );
                        true
                    }
                    Err(_) => {
                        warn!(
                            target: "relay.actor.connection",
                            connection_id = %self.connection_id,
                            frame = frame.kind(),
                            timeout_ms = self.send_timeout.as_millis() as u64,
                            "Transport write timed out, closing connection"
                        );
                        self.sink.close(1011, "send timeout").await;
                        true
                    }
                }
            }

            ConnectionMessage::Close { code, reason } => {
                debug!(
                    target: "relay.actor.connection",
                    connection_id = %self.connection_id,
                    code,
                    reason = %reason,
                    "Closing connection"
                );
                self.sink.close(code, &reason).await;
                true
            }
        }
    }
}
