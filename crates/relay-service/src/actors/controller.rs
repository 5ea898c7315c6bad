//! `RegistryControllerActor` - singleton supervisor for stream actors.
//!
//! - One per relay instance
//! - Starts a `StreamActor` when a stream goes live and tears it down when it ends
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Detects stream actors that exited or panicked via their `JoinHandle`
//!
//! [`SessionRegistry`] is the handle the rest of the service talks to. Peer
//! operations resolve the stream here once and then go straight to the
//! stream's own actor, so the controller never sits on the hot path.

use crate::errors::RelayError;
use crate::store::{SignalStore, StreamDirectory};

use super::connection::ConnectionActorHandle;
use super::messages::{JoinOutcome, LeaveOutcome, RegistryMessage, RegistryStatus, TeardownReport};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::stream::{StreamActor, StreamActorHandle, StreamSettings};

use common::types::PeerRole;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How often finished stream tasks are reaped.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for each stream actor to stop.
const STREAM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RegistryControllerActor`.
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    sender: mpsc::Sender<RegistryMessage>,
    mailbox: Arc<MailboxMonitor>,
    cancel_token: CancellationToken,
}

impl SessionRegistry {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn spawn(
        instance_id: String,
        directory: Arc<StreamDirectory>,
        store: Arc<dyn SignalStore>,
        settings: StreamSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, &instance_id));

        let actor = RegistryControllerActor {
            mailbox: Arc::clone(&mailbox),
            instance_id,
            receiver,
            cancel_token: cancel_token.clone(),
            streams: HashMap::new(),
            directory,
            store,
            settings,
            metrics,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            mailbox,
            cancel_token,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryMessage,
    ) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        self.sender.send(build(tx)).await.map_err(|e| {
            self.mailbox.record_closed();
            RelayError::Internal(format!("channel send failed: {e}"))
        })?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    /// Start the stream actor for a stream that just went live.
    /// Opening an already open stream returns the existing handle.
    pub async fn open_stream(
        &self,
        stream_id: String,
        broadcaster_id: String,
    ) -> Result<StreamActorHandle, RelayError> {
        self.request(|respond_to| RegistryMessage::OpenStream {
            stream_id,
            broadcaster_id,
            respond_to,
        })
        .await?
    }

    pub async fn get_stream(&self, stream_id: String) -> Result<Option<StreamActorHandle>, RelayError> {
        self.request(|respond_to| RegistryMessage::GetStream {
            stream_id,
            respond_to,
        })
        .await
    }

    /// Remove every peer of the stream and stop its actor.
    pub async fn close_stream(&self, stream_id: String) -> Result<TeardownReport, RelayError> {
        self.request(|respond_to| RegistryMessage::CloseStream {
            stream_id,
            respond_to,
        })
        .await?
    }

    pub async fn list_streams(&self) -> Result<Vec<StreamActorHandle>, RelayError> {
        self.request(|respond_to| RegistryMessage::ListStreams { respond_to })
            .await
    }

    pub async fn status(&self) -> Result<RegistryStatus, RelayError> {
        self.request(|respond_to| RegistryMessage::GetStatus { respond_to })
            .await
    }

    /// Register `peer_id` on `stream_id` over `connection`.
    ///
    /// # Errors
    ///
    /// `StreamNotActive` if the stream has no live session, plus anything
    /// the stream actor rejects the join with.
    pub async fn join(
        &self,
        stream_id: &str,
        peer_id: &str,
        role: PeerRole,
        connection: ConnectionActorHandle,
    ) -> Result<(StreamActorHandle, JoinOutcome), RelayError> {
        let stream = self
            .get_stream(stream_id.to_string())
            .await?
            .ok_or_else(|| RelayError::StreamNotActive(stream_id.to_string()))?;

        let outcome = stream.join(peer_id.to_string(), role, connection).await?;
        Ok((stream, outcome))
    }

    /// Remove `peer_id` from `stream_id`. Unknown streams and peers are a no-op.
    pub async fn leave(&self, stream_id: &str, peer_id: &str) -> Result<LeaveOutcome, RelayError> {
        match self.get_stream(stream_id.to_string()).await? {
            Some(stream) => match stream.leave(peer_id.to_string()).await {
                Err(RelayError::StreamNotActive(_)) => Ok(LeaveOutcome { removed: false }),
                other => other,
            },
            None => Ok(LeaveOutcome { removed: false }),
        }
    }

    /// Peers registered on `stream_id`, sorted, optionally without one id.
    pub async fn list_peers(
        &self,
        stream_id: &str,
        excluding: Option<&str>,
    ) -> Result<Vec<String>, RelayError> {
        match self.get_stream(stream_id.to_string()).await? {
            Some(stream) => match stream.list_peers(excluding.map(str::to_string)).await {
                Err(RelayError::StreamNotActive(_)) => Ok(Vec::new()),
                other => other,
            },
            None => Ok(Vec::new()),
        }
    }

    /// True if `peer_id` holds a live connection on any stream.
    pub async fn is_connected(&self, peer_id: &str) -> Result<bool, RelayError> {
        for stream in self.list_streams().await? {
            if stream.is_connected(peer_id.to_string()).await.unwrap_or(false) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stop every stream actor and then the registry itself.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token that is cancelled when the registry shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedStream {
    handle: StreamActorHandle,
    task_handle: JoinHandle<()>,
    created_at: i64,
}

/// The `RegistryControllerActor` implementation.
struct RegistryControllerActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    streams: HashMap<String, ManagedStream>,
    directory: Arc<StreamDirectory>,
    store: Arc<dyn SignalStore>,
    settings: StreamSettings,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RegistryControllerActor {
    #[instrument(skip_all, name = "relay.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.registry",
            instance_id = %self.instance_id,
            "RegistryControllerActor started"
        );

        let mut health_check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "relay.actor.registry",
                        instance_id = %self.instance_id,
                        "RegistryControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = health_check.tick() => {
                    self.check_stream_health();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "relay.actor.registry",
                                instance_id = %self.instance_id,
                                "RegistryControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "relay.actor.registry",
            instance_id = %self.instance_id,
            streams_remaining = self.streams.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::OpenStream {
                stream_id,
                broadcaster_id,
                respond_to,
            } => {
                let result = self.open_stream(stream_id, broadcaster_id);
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStream {
                stream_id,
                respond_to,
            } => {
                let handle = self
                    .streams
                    .get(&stream_id)
                    .filter(|managed| !managed.handle.is_cancelled())
                    .map(|managed| managed.handle.clone());
                let _ = respond_to.send(handle);
            }

            RegistryMessage::CloseStream {
                stream_id,
                respond_to,
            } => {
                let result = self.close_stream(&stream_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::ListStreams { respond_to } => {
                let handles = self
                    .streams
                    .values()
                    .map(|managed| managed.handle.clone())
                    .collect();
                let _ = respond_to.send(handles);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    active_streams: self.streams.len(),
                    is_shutting_down: self.cancel_token.is_cancelled(),
                });
            }
        }
    }

    fn open_stream(
        &mut self,
        stream_id: String,
        broadcaster_id: String,
    ) -> Result<StreamActorHandle, RelayError> {
        if self.cancel_token.is_cancelled() {
            return Err(RelayError::RelayUnavailable(
                "relay is shutting down".to_string(),
            ));
        }

        if let Some(managed) = self.streams.get(&stream_id) {
            if !managed.handle.is_cancelled() {
                return Ok(managed.handle.clone());
            }
        }

        let (handle, task_handle) = StreamActor::spawn(
            stream_id.clone(),
            broadcaster_id,
            self.cancel_token.child_token(),
            Arc::clone(&self.directory),
            Arc::clone(&self.store),
            self.settings,
            Arc::clone(&self.metrics),
        );

        let previous = self.streams.insert(
            stream_id.clone(),
            ManagedStream {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        if previous.is_none() {
            self.metrics.stream_opened();
        }

        info!(
            target: "relay.actor.registry",
            instance_id = %self.instance_id,
            stream_id = %stream_id,
            total_streams = self.streams.len(),
            "Stream actor started"
        );

        Ok(handle)
    }

    async fn close_stream(&mut self, stream_id: &str) -> Result<TeardownReport, RelayError> {
        let Some(managed) = self.streams.remove(stream_id) else {
            return Err(RelayError::NotFound(format!("stream {stream_id}")));
        };
        self.metrics.stream_closed();

        let report = match managed.handle.teardown().await {
            Ok(report) => report,
            Err(e) => {
                // Actor already gone; nothing left to remove
                warn!(
                    target: "relay.actor.registry",
                    stream_id = %stream_id,
                    error = %e,
                    "Stream actor unavailable during teardown"
                );
                managed.handle.cancel();
                TeardownReport::default()
            }
        };

        // Wait for the task off the message loop
        let ManagedStream {
            task_handle,
            created_at,
            ..
        } = managed;
        let stream_id_owned = stream_id.to_string();
        tokio::spawn(async move {
            match tokio::time::timeout(STREAM_STOP_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id_owned,
                        "Stream actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id_owned,
                        error = ?e,
                        "Stream actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id_owned,
                        "Stream actor task cleanup timed out"
                    );
                }
            }
        });

        info!(
            target: "relay.actor.registry",
            instance_id = %self.instance_id,
            stream_id = %stream_id,
            peers_removed = report.peers_removed,
            lifetime_secs = chrono::Utc::now().timestamp() - created_at,
            total_streams = self.streams.len(),
            "Stream actor closed"
        );

        Ok(report)
    }

    /// Reap stream actors whose task finished without a close.
    fn check_stream_health(&mut self) {
        let finished: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for stream_id in finished {
            let Some(managed) = self.streams.remove(&stream_id) else {
                continue;
            };
            self.metrics.stream_closed();

            // A finished task that was not cancelled exited on its own
            if managed.handle.is_cancelled() {
                debug!(
                    target: "relay.actor.registry",
                    stream_id = %stream_id,
                    "Reaped stopped stream actor"
                );
            } else {
                self.metrics.record_panic(ActorType::Stream);
                error!(
                    target: "relay.actor.registry",
                    instance_id = %self.instance_id,
                    stream_id = %stream_id,
                    "Stream actor exited unexpectedly"
                );
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "relay.actor.registry",
            instance_id = %self.instance_id,
            stream_count = self.streams.len(),
            "Performing graceful shutdown"
        );

        for managed in self.streams.values() {
            managed.handle.cancel();
        }

        for (stream_id, managed) in self.streams.drain() {
            match tokio::time::timeout(STREAM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id,
                        "Stream actor stopped"
                    );
                }
                Ok(Err(e)) => {
                    self.metrics.record_panic(ActorType::Stream);
                    error!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id,
                        error = ?e,
                        "Stream actor panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "relay.actor.registry",
                        stream_id = %stream_id,
                        "Stream actor did not stop within timeout"
                    );
                }
            }
            self.metrics.stream_closed();
        }
    }
}
