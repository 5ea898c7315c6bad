//! Signaling client with heartbeat and automatic rejoin.
//!
//! [`SignalingClient`] is a handle to a supervisor task that owns the
//! channel. The task joins the stream, beats every heartbeat interval and,
//! when the channel is lost, reconnects with backoff and re-sends
//! `join-stream` so the relay replays state. Envelopes sent while
//! disconnected are queued and flushed after the next `joined`.

use crate::channel::{ChannelConnector, SignalingChannel};
use crate::errors::ClientError;
use crate::reconnect::BackoffPolicy;

use common::protocol::{
    ControlFrame, ErrorCode, ServerFrame, SignalEnvelope, SignalType, CLOSE_STREAM_ENDED,
    CLOSE_SUPERSEDED,
};
use common::types::PeerRole;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default interval between client heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a best-effort `leave-stream` may take on close.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(2);

const OUTBOUND_CAPACITY: usize = 256;

/// Envelopes held while not joined. Past this the oldest is dropped.
pub const PENDING_CAPACITY: usize = 256;

/// Signaling client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub stream_id: String,
    pub peer_id: String,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl ClientConfig {
    pub fn new(stream_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            peer_id: peer_id.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// What the supervisor reports to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The relay accepted the join. `replayed` stored offers follow as frames.
    Connected { role: PeerRole, replayed: usize },
    /// A signal or control frame from the relay.
    Frame(ServerFrame),
    /// The channel was lost.
    Disconnected { close_code: Option<u16> },
    /// Waiting `delay` before reconnect attempt `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The relay refused the join for good. The client has stopped.
    Rejected { code: ErrorCode, message: String },
    /// The stream ended. The client has stopped.
    Ended,
}

/// Handle to a running signaling client.
///
/// Dropping the handle cancels the supervisor, which leaves the stream.
pub struct SignalingClient {
    stream_id: String,
    peer_id: String,
    outbound: mpsc::Sender<SignalEnvelope>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    dropped: Arc<AtomicU64>,
    cancel_token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SignalingClient {
    /// Start the supervisor task.
    pub fn spawn(config: ClientConfig, connector: Arc<dyn ChannelConnector>) -> Self {
        Self::spawn_with_token(config, connector, CancellationToken::new())
    }

    /// Start the supervisor task under an existing token.
    pub fn spawn_with_token(
        config: ClientConfig,
        connector: Arc<dyn ChannelConnector>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dropped = Arc::new(AtomicU64::new(0));

        let supervisor = Supervisor {
            config: config.clone(),
            connector,
            outbound: outbound_rx,
            events: events_tx,
            pending: VecDeque::new(),
            dropped: Arc::clone(&dropped),
            is_dropping: false,
            cancel_token: cancel_token.clone(),
            attempt: 0,
            ever_joined: false,
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            stream_id: config.stream_id,
            peer_id: config.peer_id,
            outbound: outbound_tx,
            events: events_rx,
            dropped,
            cancel_token,
            task: Some(task),
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue an envelope. Sent now if joined, after the next rejoin otherwise.
    /// At most [`PENDING_CAPACITY`] wait for a rejoin; older ones are dropped.
    ///
    /// # Errors
    ///
    /// `Closed` once the supervisor has stopped.
    pub async fn send(&self, envelope: SignalEnvelope) -> Result<(), ClientError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Send an offer to every subscriber.
    ///
    /// # Errors
    ///
    /// `Closed` once the supervisor has stopped.
    pub async fn send_offer(&self, sdp: serde_json::Value) -> Result<(), ClientError> {
        self.send(self.envelope(SignalType::Offer).with_data(sdp))
            .await
    }

    /// Answer an offer from `receiver_id`.
    ///
    /// # Errors
    ///
    /// `Closed` once the supervisor has stopped.
    pub async fn send_answer(
        &self,
        receiver_id: &str,
        sdp: serde_json::Value,
    ) -> Result<(), ClientError> {
        self.send(
            self.envelope(SignalType::Answer)
                .to_peer(receiver_id)
                .with_data(sdp),
        )
        .await
    }

    /// Send an ICE candidate to one peer, or to the whole stream.
    ///
    /// # Errors
    ///
    /// `Closed` once the supervisor has stopped.
    pub async fn send_ice_candidate(
        &self,
        receiver_id: Option<&str>,
        candidate: serde_json::Value,
    ) -> Result<(), ClientError> {
        let mut envelope = self.envelope(SignalType::IceCandidate).with_data(candidate);
        if let Some(receiver_id) = receiver_id {
            envelope = envelope.to_peer(receiver_id);
        }
        self.send(envelope).await
    }

    /// Next event, or `None` once the supervisor has stopped and every
    /// event was read.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_next_event(&mut self) -> Option<ClientEvent> {
        self.events.try_recv().ok()
    }

    /// Envelopes dropped from the rejoin queue so far.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Leave the stream and wait for the supervisor to stop.
    pub async fn close(mut self) {
        self.cancel_token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(target: "relay.client", error = %e, "Signaling client task failed");
            }
        }
    }

    fn envelope(&self, signal_type: SignalType) -> SignalEnvelope {
        SignalEnvelope::new(signal_type, self.stream_id.clone(), self.peer_id.clone())
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// How one connection ended.
enum Outcome {
    /// Reconnect after backoff.
    Lost,
    /// Stop for good.
    Stopped,
}

struct Supervisor {
    config: ClientConfig,
    connector: Arc<dyn ChannelConnector>,
    outbound: mpsc::Receiver<SignalEnvelope>,
    events: mpsc::UnboundedSender<ClientEvent>,
    /// Envelopes waiting for a joined channel.
    pending: VecDeque<SignalEnvelope>,
    dropped: Arc<AtomicU64>,
    /// Set once this outage has dropped an envelope; cleared on join.
    is_dropping: bool,
    cancel_token: CancellationToken,
    attempt: u32,
    ever_joined: bool,
}

impl Supervisor {
    #[instrument(
        skip_all,
        name = "relay.client.supervisor",
        fields(stream_id = %self.config.stream_id, peer_id = %self.config.peer_id)
    )]
    async fn run(mut self) {
        info!(target: "relay.client", "Signaling client started");

        loop {
            let connected = tokio::select! {
                () = self.cancel_token.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(channel) => {
                    if let Outcome::Stopped = self.drive(channel).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!(
                        target: "relay.client",
                        error = %e,
                        retry_count = self.attempt,
                        "Failed to connect to relay"
                    );
                }
            }

            self.attempt = self.attempt.saturating_add(1);
            let delay = self.config.backoff.delay(self.attempt);
            warn!(
                target: "relay.client",
                retry_count = self.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to relay after backoff"
            );
            self.emit(ClientEvent::Reconnecting {
                attempt: self.attempt,
                delay,
            });
            if !self.wait(delay).await {
                break;
            }
        }

        info!(target: "relay.client", "Signaling client stopped");
    }

    /// Sleep for `delay` while queueing outbound envelopes. False if cancelled.
    async fn wait(&mut self, delay: Duration) -> bool {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return false,
                () = &mut deadline => return true,
                envelope = self.outbound.recv() => match envelope {
                    Some(envelope) => self.queue(envelope),
                    None => return false,
                },
            }
        }
    }

    /// Run one connection until it is lost or the client stops.
    async fn drive(&mut self, mut channel: Box<dyn SignalingChannel>) -> Outcome {
        let join = SignalEnvelope::new(
            SignalType::JoinStream,
            self.config.stream_id.clone(),
            self.config.peer_id.clone(),
        );
        if let Err(e) = channel.send(&join).await {
            warn!(target: "relay.client", error = %e, "Failed to send join-stream");
            self.emit(ClientEvent::Disconnected { close_code: None });
            return Outcome::Lost;
        }

        let interval = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut joined = false;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    if joined {
                        self.leave(channel.as_mut()).await;
                    }
                    channel.close().await;
                    return Outcome::Stopped;
                }

                _ = heartbeat.tick() => {
                    let beat = SignalEnvelope::new(
                        SignalType::Heartbeat,
                        self.config.stream_id.clone(),
                        self.config.peer_id.clone(),
                    );
                    if let Err(e) = channel.send(&beat).await {
                        return self.lost(channel.as_mut(), &e).await;
                    }
                }

                envelope = self.outbound.recv() => {
                    let Some(envelope) = envelope else {
                        // Every handle is gone
                        if joined {
                            self.leave(channel.as_mut()).await;
                        }
                        channel.close().await;
                        return Outcome::Stopped;
                    };
                    if !joined {
                        self.queue(envelope);
                        continue;
                    }
                    if let Err(e) = channel.send(&envelope).await {
                        self.pending.push_front(envelope);
                        return self.lost(channel.as_mut(), &e).await;
                    }
                }

                frame = channel.recv() => match frame {
                    Ok(Some(frame)) => {
                        match self.on_frame(frame, &mut joined) {
                            FrameAction::Continue => {}
                            FrameAction::Flush => {
                                if let Err(e) = self.flush(channel.as_mut()).await {
                                    return self.lost(channel.as_mut(), &e).await;
                                }
                            }
                            FrameAction::Reconnect => {
                                channel.close().await;
                                self.emit(ClientEvent::Disconnected { close_code: None });
                                return Outcome::Lost;
                            }
                            FrameAction::Stop => {
                                channel.close().await;
                                return Outcome::Stopped;
                            }
                        }
                    }
                    Ok(None) => return self.closed_by_relay(channel.as_mut()),
                    Err(e) => return self.lost(channel.as_mut(), &e).await,
                },
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame, joined: &mut bool) -> FrameAction {
        match frame {
            ServerFrame::Control(ControlFrame::Joined { role, replayed, .. }) => {
                *joined = true;
                self.ever_joined = true;
                self.is_dropping = false;
                self.attempt = 0;
                info!(target: "relay.client", role = %role, replayed, "Joined stream");
                self.emit(ClientEvent::Connected { role, replayed });
                FrameAction::Flush
            }
            ServerFrame::Control(ControlFrame::Error { code, message }) if !*joined => {
                self.on_join_rejected(code, message)
            }
            ServerFrame::Control(ControlFrame::HeartbeatAck) => FrameAction::Continue,
            ServerFrame::Control(ControlFrame::StreamEnded { .. }) => {
                info!(target: "relay.client", "Stream ended by broadcaster");
                self.emit(ClientEvent::Ended);
                FrameAction::Stop
            }
            other => {
                debug!(target: "relay.client", kind = other.kind(), "Frame from relay");
                self.emit(ClientEvent::Frame(other));
                FrameAction::Continue
            }
        }
    }

    fn on_join_rejected(&mut self, code: ErrorCode, message: String) -> FrameAction {
        // A rejoining publisher can race the relay noticing its old
        // connection died; that clears once the old one times out
        let transient = code == ErrorCode::RelayUnavailable
            || (code == ErrorCode::DuplicatePublisher && self.ever_joined);
        if transient {
            warn!(target: "relay.client", code = code.as_str(), %message, "Join refused, will retry");
            return FrameAction::Reconnect;
        }
        warn!(target: "relay.client", code = code.as_str(), %message, "Join rejected");
        self.emit(ClientEvent::Rejected { code, message });
        FrameAction::Stop
    }

    fn queue(&mut self, envelope: SignalEnvelope) {
        if self.pending.len() >= PENDING_CAPACITY {
            if let Some(stale) = self.pending.pop_front() {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if self.is_dropping {
                    debug!(
                        target: "relay.client",
                        signal_type = stale.signal_type.as_str(),
                        total_dropped = total,
                        "Rejoin queue full, oldest envelope dropped"
                    );
                } else {
                    self.is_dropping = true;
                    warn!(
                        target: "relay.client",
                        signal_type = stale.signal_type.as_str(),
                        capacity = PENDING_CAPACITY,
                        total_dropped = total,
                        "Rejoin queue full, dropping oldest envelopes"
                    );
                }
            }
        }
        self.pending.push_back(envelope);
    }

    async fn flush(&mut self, channel: &mut dyn SignalingChannel) -> Result<(), ClientError> {
        while let Some(envelope) = self.pending.pop_front() {
            if let Err(e) = channel.send(&envelope).await {
                self.pending.push_front(envelope);
                return Err(e);
            }
        }
        Ok(())
    }

    fn closed_by_relay(&mut self, channel: &mut dyn SignalingChannel) -> Outcome {
        let close_code = channel.close_code();
        match close_code {
            Some(CLOSE_STREAM_ENDED) => {
                self.emit(ClientEvent::Ended);
                Outcome::Stopped
            }
            Some(CLOSE_SUPERSEDED) => {
                info!(target: "relay.client", "Connection superseded by a newer one");
                self.emit(ClientEvent::Disconnected { close_code });
                Outcome::Stopped
            }
            _ => {
                warn!(target: "relay.client", ?close_code, "Relay closed the connection");
                self.emit(ClientEvent::Disconnected { close_code });
                Outcome::Lost
            }
        }
    }

    async fn lost(&mut self, channel: &mut dyn SignalingChannel, error: &ClientError) -> Outcome {
        warn!(target: "relay.client", error = %error, "Lost relay connection");
        channel.close().await;
        self.emit(ClientEvent::Disconnected { close_code: None });
        Outcome::Lost
    }

    async fn leave(&mut self, channel: &mut dyn SignalingChannel) {
        let leave = SignalEnvelope::new(
            SignalType::LeaveStream,
            self.config.stream_id.clone(),
            self.config.peer_id.clone(),
        );
        match tokio::time::timeout(LEAVE_TIMEOUT, channel.send(&leave)).await {
            Ok(Ok(())) => debug!(target: "relay.client", "Sent leave-stream"),
            Ok(Err(e)) => debug!(target: "relay.client", error = %e, "leave-stream not sent"),
            Err(_) => debug!(target: "relay.client", "leave-stream timed out"),
        }
    }

    fn emit(&self, event: ClientEvent) {
        // The caller may have stopped listening
        let _ = self.events.send(event);
    }
}

enum FrameAction {
    Continue,
    Flush,
    Reconnect,
    Stop,
}
