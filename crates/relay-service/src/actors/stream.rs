//! `StreamActor` - one per live stream; the single writer of its peer set.
//!
//! Every join, leave, disconnect and fan-out for a stream is processed here
//! in mailbox order, so concurrent joins and leaves never lose updates to
//! the listener count. Different streams run in different actors and never
//! contend.
//!
//! # Disconnect grace
//!
//! A dropped connection does not remove the peer. The actor arms a
//! cancellable timer tagged with an epoch; a rejoin before it fires cancels
//! it and nobody is told anything. When it fires with a current epoch the
//! peer is removed exactly as if it had sent `leave-stream`.

use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::store::{purge_departed_peer, SignalStore, StreamDirectory};

use super::connection::ConnectionActorHandle;
use super::messages::{
    ForwardReport, JoinKind, JoinOutcome, LeaveOutcome, PeerSnapshot, PeerStatus, StreamMessage,
    StreamSnapshot, TeardownReport,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::{DateTime, Utc};
use common::protocol::{
    ControlFrame, LeaveReason, ServerFrame, SignalEnvelope, CLOSE_STREAM_ENDED, CLOSE_SUPERSEDED,
};
use common::types::PeerRole;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the stream mailbox.
const STREAM_CHANNEL_BUFFER: usize = 500;

/// Tunables for a stream actor.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// How long a dropped peer keeps its place before an implicit leave.
    pub grace_period: Duration,
    /// Bound on the signal purge run after an implicit leave.
    pub store_timeout: Duration,
}

/// Handle to a `StreamActor`.
#[derive(Clone, Debug)]
pub struct StreamActorHandle {
    sender: mpsc::Sender<StreamMessage>,
    mailbox: Arc<MailboxMonitor>,
    cancel_token: CancellationToken,
    stream_id: String,
    broadcaster_id: String,
}

impl StreamActorHandle {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn broadcaster_id(&self) -> &str {
        &self.broadcaster_id
    }

    /// The broadcaster publishes; everyone else subscribes.
    #[must_use]
    pub fn resolve_role(&self, peer_id: &str) -> PeerRole {
        if peer_id == self.broadcaster_id {
            PeerRole::Publisher
        } else {
            PeerRole::Subscriber
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StreamMessage,
    ) -> Result<T, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.notify(build(tx)).await?;

        rx.await
            .map_err(|e| RelayError::Internal(format!("response receive failed: {e}")))
    }

    async fn notify(&self, message: StreamMessage) -> Result<(), RelayError> {
        self.mailbox.record_enqueue();
        self.sender.send(message).await.map_err(|_| {
            self.mailbox.record_closed();
            RelayError::StreamNotActive(self.stream_id.clone())
        })
    }

    /// Register a peer on this stream.
    pub async fn join(
        &self,
        peer_id: String,
        role: PeerRole,
        connection: ConnectionActorHandle,
    ) -> Result<JoinOutcome, RelayError> {
        self.request(|respond_to| StreamMessage::Join {
            peer_id,
            role,
            connection,
            respond_to,
        })
        .await?
    }

    /// Explicit leave. Leaving twice is a no-op success.
    pub async fn leave(&self, peer_id: String) -> Result<LeaveOutcome, RelayError> {
        self.request(|respond_to| StreamMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    /// Report that a peer's connection dropped without a leave.
    pub async fn connection_lost(
        &self,
        peer_id: String,
        connection_id: String,
    ) -> Result<(), RelayError> {
        self.notify(StreamMessage::ConnectionLost {
            peer_id,
            connection_id,
        })
        .await
    }

    pub async fn heartbeat(&self, peer_id: String, connection_id: String) -> Result<(), RelayError> {
        self.notify(StreamMessage::Heartbeat {
            peer_id,
            connection_id,
        })
        .await
    }

    /// Fan an envelope out to its receiver, or to every other connected peer.
    pub async fn forward(&self, envelope: SignalEnvelope) -> Result<ForwardReport, RelayError> {
        self.request(|respond_to| StreamMessage::Forward {
            envelope,
            respond_to,
        })
        .await?
    }

    pub async fn list_peers(&self, excluding: Option<String>) -> Result<Vec<String>, RelayError> {
        self.request(|respond_to| StreamMessage::ListPeers {
            excluding,
            respond_to,
        })
        .await
    }

    pub async fn is_connected(&self, peer_id: String) -> Result<bool, RelayError> {
        self.request(|respond_to| StreamMessage::IsConnected {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<StreamSnapshot, RelayError> {
        self.request(|respond_to| StreamMessage::GetState { respond_to })
            .await
    }

    /// Remove every peer and stop the actor.
    pub async fn teardown(&self) -> Result<TeardownReport, RelayError> {
        self.request(|respond_to| StreamMessage::Teardown { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct GraceTimer {
    epoch: u64,
    cancel: CancellationToken,
}

struct PeerRecord {
    peer_id: String,
    role: PeerRole,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    /// `None` while inside the disconnect grace period.
    connection: Option<ConnectionActorHandle>,
    grace: Option<GraceTimer>,
}

impl PeerRecord {
    fn status(&self) -> PeerStatus {
        if self.connection.is_some() {
            PeerStatus::Connected
        } else {
            PeerStatus::Disconnected
        }
    }

    fn cancel_grace(&mut self) {
        if let Some(grace) = self.grace.take() {
            grace.cancel.cancel();
        }
    }
}

/// The `StreamActor` implementation.
pub struct StreamActor {
    stream_id: String,
    broadcaster_id: String,
    receiver: mpsc::Receiver<StreamMessage>,
    /// Weak so pending grace timers do not keep the mailbox open.
    self_sender: mpsc::WeakSender<StreamMessage>,
    cancel_token: CancellationToken,
    peers: HashMap<String, PeerRecord>,
    directory: Arc<StreamDirectory>,
    store: Arc<dyn SignalStore>,
    settings: StreamSettings,
    next_epoch: u64,
    /// Set once teardown starts; all joins and forwards are refused after.
    is_ending: bool,
    published_listener_count: Option<u32>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl StreamActor {
    /// Spawn a new stream actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        stream_id: String,
        broadcaster_id: String,
        cancel_token: CancellationToken,
        directory: Arc<StreamDirectory>,
        store: Arc<dyn SignalStore>,
        settings: StreamSettings,
        metrics: Arc<ActorMetrics>,
    ) -> (StreamActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Stream, &stream_id));

        let actor = Self {
            stream_id: stream_id.clone(),
            broadcaster_id: broadcaster_id.clone(),
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            directory,
            store,
            settings,
            next_epoch: 0,
            is_ending: false,
            published_listener_count: None,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = StreamActorHandle {
            sender,
            mailbox,
            cancel_token,
            stream_id,
            broadcaster_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "relay.actor.stream", fields(stream_id = %self.stream_id))]
    async fn run(mut self) {
        info!(
            target: "relay.actor.stream",
            stream_id = %self.stream_id,
            broadcaster_id = %self.broadcaster_id,
            "StreamActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        "StreamActor received cancellation signal"
                    );
                    break;
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
                                target: "relay.actor.stream",
                                stream_id = %self.stream_id,
                                "StreamActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        for record in self.peers.values_mut() {
            record.cancel_grace();
        }

        info!(
            target: "relay.actor.stream",
            stream_id = %self.stream_id,
            peers = self.peers.len(),
            messages_processed = self.mailbox.messages_processed(),
            "StreamActor stopped"
        );
    }

    async fn handle_message(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Join {
                peer_id,
                role,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, role, connection).await;
                let _ = respond_to.send(result);
            }

            StreamMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let removed = self.remove_peer(&peer_id, LeaveReason::Voluntary).await;
                let _ = respond_to.send(LeaveOutcome { removed });
            }

            StreamMessage::ConnectionLost {
                peer_id,
                connection_id,
            } => {
                self.handle_connection_lost(&peer_id, &connection_id).await;
            }

            StreamMessage::GraceExpired { peer_id, epoch } => {
                self.handle_grace_expired(&peer_id, epoch).await;
            }

            StreamMessage::Heartbeat {
                peer_id,
                connection_id,
            } => {
                if let Some(record) = self.peers.get_mut(&peer_id) {
                    let current = record
                        .connection
                        .as_ref()
                        .is_some_and(|c| c.connection_id() == connection_id);
                    if current {
                        record.last_heartbeat = Utc::now();
                    }
                }
            }

            StreamMessage::Forward {
                envelope,
                respond_to,
            } => {
                let result = self.handle_forward(&envelope);
                let _ = respond_to.send(result);
            }

            StreamMessage::ListPeers {
                excluding,
                respond_to,
            } => {
                let mut peers: Vec<String> = self
                    .peers
                    .keys()
                    .filter(|id| excluding.as_deref() != Some(id.as_str()))
                    .cloned()
                    .collect();
                peers.sort();
                let _ = respond_to.send(peers);
            }

            StreamMessage::IsConnected {
                peer_id,
                respond_to,
            } => {
                let connected = self
                    .peers
                    .get(&peer_id)
                    .is_some_and(|r| r.connection.is_some());
                let _ = respond_to.send(connected);
            }

            StreamMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            StreamMessage::Teardown { respond_to } => {
                let report = self.handle_teardown().await;
                // Cancelled before the reply so sessions see it ahead of the purge
                self.cancel_token.cancel();
                let _ = respond_to.send(report);
            }
        }
    }

    async fn handle_join(
        &mut self,
        peer_id: String,
        role: PeerRole,
        connection: ConnectionActorHandle,
    ) -> Result<JoinOutcome, RelayError> {
        if self.is_ending || !self.directory.is_active(&self.stream_id).await {
            prom::record_join(role.as_str(), "rejected");
            return Err(RelayError::StreamNotActive(self.stream_id.clone()));
        }

        let expected_role = if peer_id == self.broadcaster_id {
            PeerRole::Publisher
        } else {
            PeerRole::Subscriber
        };
        if role != expected_role {
            prom::record_join(role.as_str(), "rejected");
            return Err(RelayError::Validation(format!(
                "peer {peer_id} cannot join as {role}"
            )));
        }

        let now = Utc::now();
        let kind = match self.peers.get_mut(&peer_id) {
            Some(record) => match record.connection.as_ref() {
                None => {
                    record.cancel_grace();
                    record.connection = Some(connection);
                    record.last_heartbeat = now;
                    info!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        peer_id = %peer_id,
                        "Peer resumed within grace period"
                    );
                    JoinKind::Resumed
                }
                Some(existing) if existing.connection_id() == connection.connection_id() => {
                    record.last_heartbeat = now;
                    JoinKind::Resumed
                }
                Some(_) if role == PeerRole::Publisher => {
                    warn!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        peer_id = %peer_id,
                        "Rejected second publisher connection"
                    );
                    prom::record_join(role.as_str(), "rejected");
                    return Err(RelayError::DuplicatePublisher(self.stream_id.clone()));
                }
                Some(_) => {
                    if let Some(old) = record.connection.replace(connection) {
                        old.close(CLOSE_SUPERSEDED, "superseded by a newer connection");
                    }
                    record.last_heartbeat = now;
                    info!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        peer_id = %peer_id,
                        "Peer connection superseded"
                    );
                    JoinKind::Superseded
                }
            },
            None => {
                self.peers.insert(
                    peer_id.clone(),
                    PeerRecord {
                        peer_id: peer_id.clone(),
                        role,
                        connected_at: now,
                        last_heartbeat: now,
                        connection: Some(connection),
                        grace: None,
                    },
                );
                self.broadcast_control(
                    &peer_id,
                    ControlFrame::PeerJoined {
                        stream_id: self.stream_id.clone(),
                        peer_id: peer_id.clone(),
                        role,
                    },
                );
                self.sync_listener_count().await;
                info!(
                    target: "relay.actor.stream",
                    stream_id = %self.stream_id,
                    peer_id = %peer_id,
                    role = %role,
                    peers = self.peers.len(),
                    "Peer joined"
                );
                JoinKind::Joined
            }
        };

        prom::record_join(role.as_str(), kind.as_str());
        Ok(JoinOutcome { role, kind })
    }

    /// Remove a peer and tell the others. Returns false if it was not registered.
    async fn remove_peer(&mut self, peer_id: &str, reason: LeaveReason) -> bool {
        let Some(mut record) = self.peers.remove(peer_id) else {
            debug!(
                target: "relay.actor.stream",
                stream_id = %self.stream_id,
                peer_id = %peer_id,
                "Leave for unknown peer ignored"
            );
            return false;
        };
        record.cancel_grace();

        self.broadcast_control(
            peer_id,
            ControlFrame::PeerLeft {
                stream_id: self.stream_id.clone(),
                peer_id: peer_id.to_string(),
                reason,
            },
        );
        self.sync_listener_count().await;
        prom::record_leave(reason.as_str());

        info!(
            target: "relay.actor.stream",
            stream_id = %self.stream_id,
            peer_id = %peer_id,
            role = %record.role,
            reason = reason.as_str(),
            peers = self.peers.len(),
            "Peer left"
        );
        true
    }

    async fn handle_connection_lost(&mut self, peer_id: &str, connection_id: &str) {
        let Some(record) = self.peers.get_mut(peer_id) else {
            return;
        };

        let is_current = record
            .connection
            .as_ref()
            .is_some_and(|c| c.connection_id() == connection_id);
        if !is_current {
            debug!(
                target: "relay.actor.stream",
                stream_id = %self.stream_id,
                peer_id = %peer_id,
                connection_id = %connection_id,
                "Ignoring loss of a stale connection"
            );
            return;
        }
        record.connection = None;

        if self.settings.grace_period.is_zero() {
            self.expire_peer(peer_id).await;
            return;
        }

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let timer_token = self.cancel_token.child_token();
        record.cancel_grace();
        record.grace = Some(GraceTimer {
            epoch,
            cancel: timer_token.clone(),
        });

        let weak = self.self_sender.clone();
        let mailbox = Arc::clone(&self.mailbox);
        let grace_period = self.settings.grace_period;
        let timer_peer = peer_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                () = timer_token.cancelled() => {}
                () = tokio::time::sleep(grace_period) => {
                    if let Some(sender) = weak.upgrade() {
                        mailbox.record_enqueue();
                        let expired = StreamMessage::GraceExpired { peer_id: timer_peer, epoch };
                        if sender.send(expired).await.is_err() {
                            mailbox.record_closed();
                        }
                    }
                }
            }
        });

        info!(
            target: "relay.actor.stream",
            stream_id = %self.stream_id,
            peer_id = %peer_id,
            grace_seconds = grace_period.as_secs(),
            "Peer disconnected, grace period started"
        );
    }

    async fn handle_grace_expired(&mut self, peer_id: &str, epoch: u64) {
        let is_current = self.peers.get(peer_id).is_some_and(|r| {
            r.connection.is_none() && r.grace.as_ref().is_some_and(|g| g.epoch == epoch)
        });
        if !is_current {
            debug!(
                target: "relay.actor.stream",
                stream_id = %self.stream_id,
                peer_id = %peer_id,
                epoch,
                "Stale grace expiry ignored"
            );
            return;
        }
        self.expire_peer(peer_id).await;
    }

    /// Implicit leave: remove, notify, and purge the peer's stored signals.
    async fn expire_peer(&mut self, peer_id: &str) {
        if !self.remove_peer(peer_id, LeaveReason::Timeout).await {
            return;
        }

        // Awaited: a rejoin queued behind this must not lose its new offers.
        // Failures are logged by the purge itself.
        let _ = purge_departed_peer(
            self.store.as_ref(),
            &self.stream_id,
            peer_id,
            self.settings.store_timeout,
        )
        .await;
    }

    fn handle_forward(&self, envelope: &SignalEnvelope) -> Result<ForwardReport, RelayError> {
        if self.is_ending {
            return Err(RelayError::StreamNotActive(self.stream_id.clone()));
        }
        if !self.peers.contains_key(&envelope.sender_id) {
            return Err(RelayError::Validation(format!(
                "sender {} has not joined stream {}",
                envelope.sender_id, self.stream_id
            )));
        }

        let frame = ServerFrame::Signal(envelope.clone());
        let mut report = ForwardReport::default();

        match envelope.receiver_id.as_deref() {
            Some(target) => match self.peers.get(target).and_then(|r| r.connection.as_ref()) {
                Some(connection) => self.deliver(connection, frame, &mut report),
                None => {
                    debug!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        receiver_id = %target,
                        signal_type = envelope.signal_type.as_str(),
                        "Receiver not connected, kept for replay only"
                    );
                    report.target_offline = true;
                }
            },
            None => {
                for (peer_id, record) in &self.peers {
                    if *peer_id == envelope.sender_id {
                        continue;
                    }
                    if let Some(connection) = &record.connection {
                        self.deliver(connection, frame.clone(), &mut report);
                    }
                }
            }
        }

        prom::record_signal_forwarded(envelope.signal_type.as_str(), report.delivered);
        Ok(report)
    }

    fn deliver(
        &self,
        connection: &ConnectionActorHandle,
        frame: ServerFrame,
        report: &mut ForwardReport,
    ) {
        match connection.send(frame) {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.dropped += 1;
                warn!(
                    target: "relay.actor.stream",
                    stream_id = %self.stream_id,
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Forward to peer failed"
                );
            }
        }
    }

    /// Best-effort notice to every connected peer except `except_peer_id`.
    fn broadcast_control(&self, except_peer_id: &str, frame: ControlFrame) {
        let frame = ServerFrame::Control(frame);
        for (peer_id, record) in &self.peers {
            if peer_id == except_peer_id {
                continue;
            }
            if let Some(connection) = &record.connection {
                if let Err(e) = connection.send(frame.clone()) {
                    debug!(
                        target: "relay.actor.stream",
                        stream_id = %self.stream_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Peer notification dropped"
                    );
                }
            }
        }
    }

    async fn handle_teardown(&mut self) -> TeardownReport {
        self.is_ending = true;
        let peers_removed = self.peers.len();

        for (_, mut record) in self.peers.drain() {
            record.cancel_grace();
            if let Some(connection) = record.connection.take() {
                let _ = connection.send(ServerFrame::Control(ControlFrame::StreamEnded {
                    stream_id: self.stream_id.clone(),
                }));
                connection.close(CLOSE_STREAM_ENDED, "stream ended");
            }
            prom::record_leave(LeaveReason::StreamEnded.as_str());
        }
        self.sync_listener_count().await;

        info!(
            target: "relay.actor.stream",
            stream_id = %self.stream_id,
            peers_removed,
            "Stream torn down"
        );
        TeardownReport { peers_removed }
    }

    fn listener_count(&self) -> u32 {
        let count = self
            .peers
            .values()
            .filter(|r| r.role == PeerRole::Subscriber)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    /// Push the subscriber count to the directory. Runs inside the same
    /// message as the mutation, so the count is settled before the next one.
    async fn sync_listener_count(&mut self) {
        let count = self.listener_count();
        if self.published_listener_count == Some(count) {
            return;
        }
        if self.directory.set_listener_count(&self.stream_id, count).await {
            self.published_listener_count = Some(count);
        }
    }

    fn snapshot(&self) -> StreamSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .peers
            .values()
            .map(|r| PeerSnapshot {
                peer_id: r.peer_id.clone(),
                stream_id: self.stream_id.clone(),
                role: r.role,
                status: r.status(),
                connected_at: r.connected_at,
                last_heartbeat: r.last_heartbeat,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        StreamSnapshot {
            stream_id: self.stream_id.clone(),
            broadcaster_id: self.broadcaster_id.clone(),
            listener_count: self.listener_count(),
            peers,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::connection::{ConnectionActor, ConnectionSettings};
    use crate::relay::transport::ChannelFrameSink;
    use crate::store::InMemorySignalStore;
    use crate::store::StoredSignal;
    use common::protocol::SignalType;
    use common::types::Stream;
    use serde_json::json;

    struct Fixture {
        handle: StreamActorHandle,
        directory: Arc<StreamDirectory>,
        store: Arc<InMemorySignalStore>,
        metrics: Arc<ActorMetrics>,
    }

    async fn fixture(grace_period: Duration) -> Fixture {
        let directory = Arc::new(StreamDirectory::new());
        let now = Utc::now();
        directory
            .insert(Stream {
                id: "s1".to_string(),
                title: "Sunday Service".to_string(),
                stream_url: "stream-s1".to_string(),
                broadcaster_id: "b1".to_string(),
                is_active: false,
                listener_count: 0,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        directory.activate("s1").await.unwrap();

        let store = Arc::new(InMemorySignalStore::new());
        let metrics = ActorMetrics::new();
        let (handle, _task) = StreamActor::spawn(
            "s1".to_string(),
            "b1".to_string(),
            CancellationToken::new(),
            Arc::clone(&directory),
            store.clone(),
            StreamSettings {
                grace_period,
                store_timeout: Duration::from_secs(1),
            },
            Arc::clone(&metrics),
        );

        Fixture {
            handle,
            directory,
            store,
            metrics,
        }
    }

    fn connection(
        id: &str,
        metrics: &Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let (handle, _task) = ConnectionActor::spawn(
            id.to_string(),
            ChannelFrameSink::new(tx),
            CancellationToken::new(),
            ConnectionSettings {
                mailbox_capacity: 64,
                send_timeout: Duration::from_secs(1),
            },
            Arc::clone(metrics),
        );
        (handle, rx)
    }

    async fn join(fx: &Fixture, peer: &str, conn: &str) -> mpsc::Receiver<ServerFrame> {
        let (handle, rx) = connection(conn, &fx.metrics);
        let role = fx.handle.resolve_role(peer);
        fx.handle
            .join(peer.to_string(), role, handle)
            .await
            .unwrap();
        rx
    }

    async fn listener_count(fx: &Fixture) -> u32 {
        fx.directory.get("s1").await.unwrap().listener_count
    }

    fn drain(rx: &mut mpsc::Receiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn offer(sender: &str) -> SignalEnvelope {
        SignalEnvelope::new(SignalType::Offer, "s1", sender).with_data(json!({"sdp": "v=0"}))
    }

    #[tokio::test]
    async fn test_join_counts_subscribers_only() {
        let fx = fixture(Duration::from_secs(30)).await;

        let _b = join(&fx, "b1", "conn-b").await;
        assert_eq!(listener_count(&fx).await, 0);

        let _a = join(&fx, "listener-a", "conn-a").await;
        let _c = join(&fx, "listener-c", "conn-c").await;
        assert_eq!(listener_count(&fx).await, 2);

        let peers = fx.handle.list_peers(Some("b1".to_string())).await.unwrap();
        assert_eq!(peers, vec!["listener-a".to_string(), "listener-c".to_string()]);
        assert!(fx.handle.is_connected("listener-a".to_string()).await.unwrap());
        assert!(!fx.handle.is_connected("nobody".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_publisher_rejected() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _first = join(&fx, "b1", "conn-1").await;

        let (second, _rx) = connection("conn-2", &fx.metrics);
        let result = fx
            .handle
            .join("b1".to_string(), PeerRole::Publisher, second)
            .await;
        assert!(matches!(result, Err(RelayError::DuplicatePublisher(_))));

        // First publisher is untouched
        assert!(fx.handle.is_connected("b1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_role_must_match_broadcaster() {
        let fx = fixture(Duration::from_secs(30)).await;
        let (conn, _rx) = connection("conn-x", &fx.metrics);
        let result = fx
            .handle
            .join("listener-a".to_string(), PeerRole::Publisher, conn)
            .await;
        assert!(matches!(result, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_join_rejected_when_stream_not_active() {
        let fx = fixture(Duration::from_secs(30)).await;
        fx.directory.mark_ended("s1").await.unwrap();

        let (conn, _rx) = connection("conn-a", &fx.metrics);
        let result = fx
            .handle
            .join("listener-a".to_string(), PeerRole::Subscriber, conn)
            .await;
        assert!(matches!(result, Err(RelayError::StreamNotActive(_))));
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let _a = join(&fx, "listener-a", "conn-a").await;
        settle().await;
        drain(&mut b);

        let first = fx.handle.leave("listener-a".to_string()).await.unwrap();
        let second = fx.handle.leave("listener-a".to_string()).await.unwrap();
        assert!(first.removed);
        assert!(!second.removed);
        assert_eq!(listener_count(&fx).await, 0);

        settle().await;
        let left: Vec<_> = drain(&mut b)
            .into_iter()
            .filter(|f| f.kind() == "peer-left")
            .collect();
        assert_eq!(left.len(), 1, "exactly one departure notice");
    }

    #[tokio::test]
    async fn test_forward_broadcast_skips_sender() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let mut a = join(&fx, "listener-a", "conn-a").await;
        let mut c = join(&fx, "listener-c", "conn-c").await;
        settle().await;
        drain(&mut b);
        drain(&mut a);
        drain(&mut c);

        let report = fx.handle.forward(offer("b1")).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 0);

        settle().await;
        assert!(drain(&mut b).is_empty());
        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut c).len(), 1);
    }

    #[tokio::test]
    async fn test_forward_to_receiver_only() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let mut a = join(&fx, "listener-a", "conn-a").await;
        let mut c = join(&fx, "listener-c", "conn-c").await;
        settle().await;
        drain(&mut b);
        drain(&mut a);
        drain(&mut c);

        let answer = SignalEnvelope::new(SignalType::Answer, "s1", "listener-a")
            .to_peer("b1")
            .with_data(json!({"sdp": "answer"}));
        let report = fx.handle.forward(answer).await.unwrap();
        assert_eq!(report.delivered, 1);

        settle().await;
        let frames = drain(&mut b);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ServerFrame::Signal(envelope) => assert_eq!(envelope.sender_id, "listener-a"),
            other => panic!("unexpected frame {other:?}"),
        }
        assert!(drain(&mut c).is_empty());
    }

    #[tokio::test]
    async fn test_forward_to_offline_receiver_is_noop() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _b = join(&fx, "b1", "conn-b").await;

        let envelope = offer("b1").to_peer("listener-gone");
        let report = fx.handle.forward(envelope).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert!(report.target_offline);
    }

    #[tokio::test]
    async fn test_forward_from_non_member_rejected() {
        let fx = fixture(Duration::from_secs(30)).await;
        let result = fx.handle.forward(offer("stranger")).await;
        assert!(matches!(result, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_one_full_mailbox_does_not_block_others() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _b = join(&fx, "b1", "conn-b").await;

        // A peer whose transport never drains, behind a one-slot mailbox
        let (stuck_tx, _stuck_rx) = mpsc::channel(1);
        let (stuck, _task) = ConnectionActor::spawn(
            "conn-stuck".to_string(),
            ChannelFrameSink::new(stuck_tx),
            CancellationToken::new(),
            ConnectionSettings {
                mailbox_capacity: 1,
                send_timeout: Duration::from_secs(60),
            },
            Arc::clone(&fx.metrics),
        );
        fx.handle
            .join("listener-stuck".to_string(), PeerRole::Subscriber, stuck)
            .await
            .unwrap();
        let mut healthy = join(&fx, "listener-ok", "conn-ok").await;
        settle().await;
        drain(&mut healthy);

        let mut dropped = 0;
        for _ in 0..5 {
            let report = fx.handle.forward(offer("b1")).await.unwrap();
            dropped += report.dropped;
        }
        settle().await;

        assert!(dropped > 0, "stuck peer should shed frames");
        assert_eq!(drain(&mut healthy).len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_within_grace_is_silent() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let _a = join(&fx, "listener-a", "conn-a-1").await;
        settle().await;
        drain(&mut b);

        fx.handle
            .connection_lost("listener-a".to_string(), "conn-a-1".to_string())
            .await
            .unwrap();
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        let peer = state.peers.iter().find(|p| p.peer_id == "listener-a").unwrap();
        assert_eq!(peer.status, PeerStatus::Disconnected);
        assert_eq!(listener_count(&fx).await, 1);

        tokio::time::advance(Duration::from_secs(20)).await;

        let (conn, _rx) = connection("conn-a-2", &fx.metrics);
        let outcome = fx
            .handle
            .join("listener-a".to_string(), PeerRole::Subscriber, conn)
            .await
            .unwrap();
        assert_eq!(outcome.kind, JoinKind::Resumed);

        // Past the first deadline: the cancelled timer must not fire
        tokio::time::advance(Duration::from_secs(20)).await;
        settle().await;

        assert!(fx.handle.is_connected("listener-a".to_string()).await.unwrap());
        assert_eq!(listener_count(&fx).await, 1);
        assert!(
            drain(&mut b).is_empty(),
            "no leave/join events inside the grace window"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_removes_peer_once() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let _a = join(&fx, "listener-a", "conn-a-1").await;
        fx.store
            .append(StoredSignal::from_envelope(
                &SignalEnvelope::new(SignalType::Answer, "s1", "listener-a")
                    .to_peer("b1")
                    .with_data(json!({})),
            ))
            .await
            .unwrap();
        settle().await;
        drain(&mut b);

        fx.handle
            .connection_lost("listener-a".to_string(), "conn-a-1".to_string())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        settle().await;
        assert_eq!(listener_count(&fx).await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(listener_count(&fx).await, 0);
        assert_eq!(fx.store.len("s1").await, 0, "departed peer's signals purged");

        // Explicit leave after expiry is a no-op
        let outcome = fx.handle.leave("listener-a".to_string()).await.unwrap();
        assert!(!outcome.removed);

        // Rejoin after the window: exactly one leave then one join
        let _a2 = join(&fx, "listener-a", "conn-a-2").await;
        settle().await;
        let kinds: Vec<&str> = drain(&mut b).iter().map(ServerFrame::kind).collect();
        assert_eq!(kinds, vec!["peer-left", "peer-joined"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_loss_ignored() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _a1 = join(&fx, "listener-a", "conn-a-1").await;
        let (conn2, _rx2) = connection("conn-a-2", &fx.metrics);
        let outcome = fx
            .handle
            .join("listener-a".to_string(), PeerRole::Subscriber, conn2)
            .await
            .unwrap();
        assert_eq!(outcome.kind, JoinKind::Superseded);

        // The superseded connection reporting its own loss must not start a grace timer
        fx.handle
            .connection_lost("listener-a".to_string(), "conn-a-1".to_string())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        assert!(fx.handle.is_connected("listener-a".to_string()).await.unwrap());
        assert_eq!(listener_count(&fx).await, 1);
    }

    #[tokio::test]
    async fn test_zero_grace_leaves_immediately() {
        let fx = fixture(Duration::ZERO).await;
        let _a = join(&fx, "listener-a", "conn-a").await;

        fx.handle
            .connection_lost("listener-a".to_string(), "conn-a".to_string())
            .await
            .unwrap();
        let peers = fx.handle.list_peers(None).await.unwrap();
        assert!(peers.is_empty());
        assert_eq!(listener_count(&fx).await, 0);
    }

    #[tokio::test]
    async fn test_expiry_purge_completes_before_rejoin() {
        let fx = fixture(Duration::ZERO).await;
        let _a = join(&fx, "listener-a", "conn-a-1").await;
        fx.store
            .append(StoredSignal::from_envelope(&offer("listener-a")))
            .await
            .unwrap();

        fx.handle
            .connection_lost("listener-a".to_string(), "conn-a-1".to_string())
            .await
            .unwrap();
        // Served after the expiry, so its purge has finished
        assert!(fx.handle.list_peers(None).await.unwrap().is_empty());
        assert_eq!(fx.store.len("s1").await, 0);

        let _a2 = join(&fx, "listener-a", "conn-a-2").await;
        fx.store
            .append(StoredSignal::from_envelope(&offer("listener-a")))
            .await
            .unwrap();
        settle().await;
        assert_eq!(fx.store.len("s1").await, 1, "offer sent after rejoin is kept");
    }

    #[tokio::test]
    async fn test_mailbox_depth_counts_queued_messages() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _a = join(&fx, "listener-a", "conn-a").await;
        settle().await;
        assert_eq!(fx.handle.mailbox.current_depth(), 0);

        // Notifications return once queued; the actor has not run yet
        for _ in 0..3 {
            fx.handle
                .heartbeat("listener-a".to_string(), "conn-a".to_string())
                .await
                .unwrap();
        }
        assert_eq!(fx.handle.mailbox.current_depth(), 3);

        settle().await;
        assert_eq!(fx.handle.mailbox.current_depth(), 0);
        assert!(fx.handle.mailbox.peak_depth() >= 3);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_last_seen() {
        let fx = fixture(Duration::from_secs(30)).await;
        let _a = join(&fx, "listener-a", "conn-a").await;
        let before = fx.handle.get_state().await.unwrap().peers[0].last_heartbeat;

        tokio::time::sleep(Duration::from_millis(5)).await;
        fx.handle
            .heartbeat("listener-a".to_string(), "conn-a".to_string())
            .await
            .unwrap();

        let after = fx.handle.get_state().await.unwrap().peers[0].last_heartbeat;
        assert!(after >= before);
    }

    #[tokio::test]
    async fn test_teardown_removes_everyone_and_stops() {
        let fx = fixture(Duration::from_secs(30)).await;
        let mut b = join(&fx, "b1", "conn-b").await;
        let mut a = join(&fx, "listener-a", "conn-a").await;
        assert_eq!(listener_count(&fx).await, 1);

        let report = fx.handle.teardown().await.unwrap();
        assert!(fx.handle.is_cancelled(), "cancelled by the time teardown replies");
        assert_eq!(report.peers_removed, 2);
        assert_eq!(listener_count(&fx).await, 0);

        // Every connection is told and then closed
        let mut a_kinds = Vec::new();
        while let Some(frame) = a.recv().await {
            a_kinds.push(frame.kind());
        }
        assert_eq!(a_kinds.last(), Some(&"stream-ended"));
        while b.recv().await.is_some() {}

        settle().await;
        assert!(fx.handle.is_cancelled());
        assert!(matches!(
            fx.handle.leave("listener-a".to_string()).await,
            Err(RelayError::StreamNotActive(_))
        ));
    }
}
