//! `RelaySession` - the per-connection signaling state machine.
//!
//! ```text
//! AwaitingJoin --join-stream--> Joined --leave-stream--> AwaitingJoin
//!      |                          |
//!      +-- anything else as the   +-- offer / answer / ice-candidate:
//!          first frame: close 4001    persist, then fan out
//! ```
//!
//! The session owns nothing shared. Membership lives in the stream actor,
//! outbound writes go through the connection actor, and stored envelopes
//! go through the [`SignalStore`](crate::store::SignalStore).

use crate::actors::{ConnectionActorHandle, StreamActorHandle};
use crate::errors::RelayError;
use crate::observability::metrics as prom;
use crate::store::{persist_with_retry, purge_departed_peer, with_timeout, StoredSignal};

use super::{Inbound, RelayContext};

use common::protocol::{
    ControlFrame, ErrorCode, ServerFrame, SignalEnvelope, SignalType, CLOSE_HEARTBEAT_TIMEOUT,
    CLOSE_JOIN_REQUIRED,
};
use common::types::PeerRole;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

enum SessionState {
    AwaitingJoin,
    Joined {
        stream: StreamActorHandle,
        peer_id: String,
        role: PeerRole,
    },
}

/// Per-connection relay context.
pub struct RelaySession {
    ctx: RelayContext,
    connection: ConnectionActorHandle,
    state: SessionState,
    /// Set after the first successful join; only a first frame can be fatal.
    has_joined: bool,
}

impl RelaySession {
    #[must_use]
    pub fn new(ctx: RelayContext, connection: ConnectionActorHandle) -> Self {
        Self {
            ctx,
            connection,
            state: SessionState::AwaitingJoin,
            has_joined: false,
        }
    }

    /// Process inbound events until the client leaves, the heartbeat
    /// deadline passes, the transport fails, or the server shuts down.
    #[instrument(
        skip_all,
        name = "relay.session",
        fields(connection_id = %self.connection.connection_id())
    )]
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        let heartbeat_timeout = self.ctx.settings.heartbeat_timeout;
        let mut deadline = Instant::now() + heartbeat_timeout;
        let shutdown = self.ctx.shutdown.clone();
        let connection = self.connection.clone();

        debug!(
            target: "relay.session",
            connection_id = %connection.connection_id(),
            "Relay session started"
        );

        // False once a close with a specific code has been queued
        let mut release_connection = true;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    debug!(target: "relay.session", "Server shutting down, closing session");
                    connection.close(1001, "server shutting down");
                    release_connection = false;
                    break;
                }

                () = connection.closed() => {
                    debug!(target: "relay.session", "Outbound half closed, ending session");
                    break;
                }

                () = tokio::time::sleep_until(deadline) => {
                    warn!(
                        target: "relay.session",
                        connection_id = %connection.connection_id(),
                        peer_id = self.peer_id().unwrap_or("-"),
                        timeout_secs = heartbeat_timeout.as_secs(),
                        "Heartbeat timeout, closing connection"
                    );
                    connection.close(CLOSE_HEARTBEAT_TIMEOUT, "heartbeat timeout");
                    release_connection = false;
                    break;
                }

                event = inbound.recv() => {
                    match event {
                        Some(Inbound::Text(text)) => {
                            deadline = Instant::now() + heartbeat_timeout;
                            self.handle_text(&text).await;
                        }
                        Some(Inbound::Activity) => {
                            deadline = Instant::now() + heartbeat_timeout;
                        }
                        Some(Inbound::Closed) | None => break,
                    }
                }
            }
        }

        self.finish(release_connection).await;
    }

    fn peer_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Joined { peer_id, .. } => Some(peer_id),
            SessionState::AwaitingJoin => None,
        }
    }

    /// The connection ended without a `leave-stream`: hand the peer to the
    /// stream's grace timer and release the outbound half.
    async fn finish(&mut self, release_connection: bool) {
        if let SessionState::Joined {
            stream, peer_id, ..
        } = &self.state
        {
            let connection_id = self.connection.connection_id().to_string();
            if let Err(e) = stream.connection_lost(peer_id.clone(), connection_id).await {
                debug!(
                    target: "relay.session",
                    peer_id = %peer_id,
                    error = %e,
                    "Stream gone before connection loss was reported"
                );
            }
        }
        if release_connection {
            self.connection.cancel();
        }

        debug!(
            target: "relay.session",
            connection_id = %self.connection.connection_id(),
            "Relay session ended"
        );
    }

    async fn handle_text(&mut self, text: &str) {
        let envelope = match SignalEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                prom::record_signal_rejected("malformed");
                warn!(
                    target: "relay.session",
                    connection_id = %self.connection.connection_id(),
                    error = %e,
                    "Dropped malformed envelope"
                );
                self.send(ControlFrame::error(ErrorCode::ValidationError, e.to_string()));
                return;
            }
        };

        if envelope.signal_type == SignalType::Heartbeat {
            self.handle_heartbeat().await;
            return;
        }

        if matches!(self.state, SessionState::AwaitingJoin) {
            match envelope.signal_type {
                SignalType::JoinStream => self.handle_join(&envelope).await,
                // Repeat leave after a leave: already out, nothing to do
                SignalType::LeaveStream if self.has_joined => {
                    debug!(
                        target: "relay.session",
                        stream_id = %envelope.stream_id,
                        peer_id = %envelope.sender_id,
                        "Repeated leave-stream ignored"
                    );
                }
                _ => self.reject_before_join(&envelope),
            }
            return;
        }

        if let Err(e) = self.check_identity(&envelope) {
            prom::record_signal_rejected("identity_mismatch");
            self.send_error(&e);
            return;
        }

        match envelope.signal_type {
            // Same stream and peer: acknowledge again and replay
            SignalType::JoinStream => self.handle_join(&envelope).await,
            SignalType::LeaveStream => self.handle_leave().await,
            SignalType::Offer | SignalType::Answer | SignalType::IceCandidate => {
                self.handle_relay(envelope).await;
            }
            SignalType::Heartbeat => {}
        }
    }

    fn reject_before_join(&self, envelope: &SignalEnvelope) {
        prom::record_signal_rejected("join_required");
        warn!(
            target: "relay.session",
            connection_id = %self.connection.connection_id(),
            signal_type = envelope.signal_type.as_str(),
            "Frame received before join-stream"
        );
        self.send(ControlFrame::error(
            ErrorCode::JoinRequired,
            "join-stream must be sent first",
        ));
        if !self.has_joined {
            self.connection.close(CLOSE_JOIN_REQUIRED, "join-stream required");
        }
    }

    /// After a join, every frame must name the joined stream and peer.
    fn check_identity(&self, envelope: &SignalEnvelope) -> Result<(), RelayError> {
        let SessionState::Joined {
            stream, peer_id, ..
        } = &self.state
        else {
            return Ok(());
        };

        if envelope.stream_id != stream.stream_id() {
            return Err(RelayError::Validation(format!(
                "connection is joined to stream {}",
                stream.stream_id()
            )));
        }
        if envelope.sender_id != *peer_id {
            return Err(RelayError::Validation(
                "senderId does not match the joined peer".to_string(),
            ));
        }
        Ok(())
    }

    async fn handle_heartbeat(&mut self) {
        if let SessionState::Joined {
            stream, peer_id, ..
        } = &self.state
        {
            let connection_id = self.connection.connection_id().to_string();
            let _ = stream.heartbeat(peer_id.clone(), connection_id).await;
        }
        self.send(ControlFrame::HeartbeatAck);
    }

    async fn handle_join(&mut self, envelope: &SignalEnvelope) {
        let stream_id = envelope.stream_id.clone();
        let peer_id = envelope.sender_id.clone();

        let stream = match self.ctx.registry.get_stream(stream_id.clone()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                prom::record_join("unknown", "rejected");
                self.send_error(&RelayError::StreamNotActive(stream_id));
                return;
            }
            Err(e) => {
                self.send_error(&e);
                return;
            }
        };

        let role = stream.resolve_role(&peer_id);
        let outcome = match stream
            .join(peer_id.clone(), role, self.connection.clone())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                info!(
                    target: "relay.session",
                    stream_id = %stream_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Join rejected"
                );
                self.send_error(&e);
                return;
            }
        };

        self.state = SessionState::Joined {
            stream,
            peer_id: peer_id.clone(),
            role,
        };
        self.has_joined = true;

        let (offers, replay_error) = self.load_replay(&stream_id, &peer_id).await;

        self.send(ControlFrame::Joined {
            stream_id: stream_id.clone(),
            peer_id: peer_id.clone(),
            role,
            replayed: offers.len(),
        });
        for offer in &offers {
            self.send(offer.to_envelope());
        }
        if let Some(e) = replay_error {
            self.send(ControlFrame::warning(e.error_code(), e.client_message()));
        }

        info!(
            target: "relay.session",
            stream_id = %stream_id,
            peer_id = %peer_id,
            role = %role,
            join = outcome.kind.as_str(),
            replayed = offers.len(),
            "Peer joined stream"
        );
    }

    /// Stored offers for a joining peer, most recent first. A store failure
    /// degrades to an empty replay plus a warning.
    async fn load_replay(
        &self,
        stream_id: &str,
        peer_id: &str,
    ) -> (Vec<StoredSignal>, Option<RelayError>) {
        let limit = self.ctx.settings.offer_replay_limit;
        let result = with_timeout(
            "recent_offers",
            self.ctx.settings.store_timeout,
            self.ctx.store.recent_offers(stream_id, peer_id, limit),
        )
        .await;

        match result {
            Ok(offers) => (offers, None),
            Err(e) => {
                warn!(
                    target: "relay.session",
                    stream_id = %stream_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Offer replay unavailable"
                );
                (Vec::new(), Some(e.into()))
            }
        }
    }

    async fn handle_leave(&mut self) {
        let SessionState::Joined {
            stream, peer_id, ..
        } = std::mem::replace(&mut self.state, SessionState::AwaitingJoin)
        else {
            return;
        };

        let removed = match stream.leave(peer_id.clone()).await {
            Ok(outcome) => outcome.removed,
            Err(e) => {
                debug!(
                    target: "relay.session",
                    peer_id = %peer_id,
                    error = %e,
                    "Stream gone before leave"
                );
                false
            }
        };

        let purge = purge_departed_peer(
            self.ctx.store.as_ref(),
            stream.stream_id(),
            &peer_id,
            self.ctx.settings.store_timeout,
        )
        .await;
        if let Err(e) = purge {
            let e = RelayError::from(e);
            self.send(ControlFrame::warning(e.error_code(), e.client_message()));
        }

        info!(
            target: "relay.session",
            stream_id = %stream.stream_id(),
            peer_id = %peer_id,
            removed,
            "Peer left stream"
        );
    }

    async fn handle_relay(&mut self, envelope: SignalEnvelope) {
        let SessionState::Joined { stream, role, .. } = &self.state else {
            return;
        };
        let stream = stream.clone();
        let role = *role;

        // Teardown cancels the stream before its purge runs
        if stream.is_cancelled() {
            let e = RelayError::StreamNotActive(stream.stream_id().to_string());
            prom::record_signal_rejected(e.kind());
            self.send_error(&e);
            return;
        }

        let stored = StoredSignal::from_envelope(&envelope);
        let persisted = persist_with_retry(
            self.ctx.store.as_ref(),
            &stored,
            self.ctx.settings.store_timeout,
        )
        .await;

        if let Err(e) = persisted {
            // Still forwarded best-effort; the sender learns it was not stored
            let e = RelayError::from(e);
            self.send(ControlFrame::warning(e.error_code(), e.client_message()));
        } else if stream.is_cancelled() && !self.ctx.registry.is_cancelled() {
            // Ended mid-write: the teardown purge may already have run
            self.purge_ended_stream(stream.stream_id()).await;
        }

        let signal_type = envelope.signal_type;
        match stream.forward(envelope).await {
            Ok(report) => {
                debug!(
                    target: "relay.session",
                    stream_id = %stream.stream_id(),
                    signal_type = signal_type.as_str(),
                    role = %role,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    target_offline = report.target_offline,
                    "Signal relayed"
                );
            }
            Err(e) => {
                prom::record_signal_rejected(e.kind());
                self.send_error(&e);
            }
        }
    }

    async fn purge_ended_stream(&self, stream_id: &str) {
        let purge = with_timeout(
            "purge_stream",
            self.ctx.settings.store_timeout,
            self.ctx.store.purge_stream(stream_id),
        )
        .await;
        match purge {
            Ok(removed) => debug!(
                target: "relay.session",
                stream_id = %stream_id,
                removed,
                "Purged signals written during teardown"
            ),
            Err(e) => warn!(
                target: "relay.session",
                stream_id = %stream_id,
                error = %e,
                "Failed to purge signals written during teardown"
            ),
        }
    }

    fn send_error(&self, error: &RelayError) {
        self.send(ControlFrame::error(error.error_code(), error.client_message()));
    }

    fn send(&self, frame: impl Into<ServerFrame>) {
        if let Err(e) = self.connection.send(frame.into()) {
            debug!(
                target: "relay.session",
                connection_id = %self.connection.connection_id(),
                error = %e,
                "Reply to client dropped"
            );
        }
    }
}
