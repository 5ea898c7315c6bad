//! Broadcast control API.
//!
//! The entry points a UI calls: start or stop a broadcast, tune in to one
//! by its shareable URL, and leave. Each live broadcast or listen is a
//! session guard owning its signaling client, so dropping the guard on any
//! path leaves the stream.

use crate::audio::AudioSettings;
use crate::catalog::StreamCatalog;
use crate::channel::ChannelConnector;
use crate::client::{ClientConfig, ClientEvent, SignalingClient, DEFAULT_HEARTBEAT_INTERVAL};
use crate::errors::ClientError;
use crate::reconnect::BackoffPolicy;

use common::protocol::ErrorCode;
use common::types::{PeerRole, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// How long to wait for the first `joined`.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BroadcastControl {
    catalog: Arc<dyn StreamCatalog>,
    connector: Arc<dyn ChannelConnector>,
    caller_id: String,
    heartbeat_interval: Duration,
    backoff: BackoffPolicy,
    join_timeout: Duration,
}

impl BroadcastControl {
    pub fn new(
        catalog: Arc<dyn StreamCatalog>,
        connector: Arc<dyn ChannelConnector>,
        caller_id: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            connector,
            caller_id: caller_id.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            backoff: BackoffPolicy::default(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
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

    #[must_use]
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    #[must_use]
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<dyn StreamCatalog> {
        &self.catalog
    }

    /// Create a stream and join it as its publisher.
    ///
    /// If the join fails the new stream is ended again.
    ///
    /// # Errors
    ///
    /// Registry errors from creating the stream, `Rejected` if the relay
    /// refuses the join, `Transport` if no join completes in time.
    #[instrument(skip_all, name = "relay.client.start_broadcast", fields(broadcaster_id = %self.caller_id))]
    pub async fn start_broadcast(&self, title: &str) -> Result<BroadcastSession, ClientError> {
        let stream = self.catalog.create_stream(title, &self.caller_id).await?;

        let client = match self.join(&stream.id).await {
            Ok((client, _)) => client,
            Err(e) => {
                if let Err(end_error) = self.catalog.end_stream(&stream.id).await {
                    warn!(
                        target: "relay.client",
                        stream_id = %stream.id,
                        error = %end_error,
                        "Failed to end stream after failed start"
                    );
                }
                return Err(e);
            }
        };

        info!(
            target: "relay.client",
            stream_id = %stream.id,
            stream_url = %stream.stream_url,
            "Broadcast started"
        );
        Ok(BroadcastSession {
            stream,
            client,
            audio: AudioSettings::default(),
        })
    }

    /// Leave as publisher and end the stream.
    ///
    /// # Errors
    ///
    /// Registry errors from ending the stream.
    #[instrument(skip_all, name = "relay.client.stop_broadcast", fields(stream_id = %session.stream.id))]
    pub async fn stop_broadcast(&self, session: BroadcastSession) -> Result<(), ClientError> {
        let BroadcastSession { stream, client, .. } = session;
        client.close().await;
        self.catalog.end_stream(&stream.id).await?;
        info!(target: "relay.client", stream_id = %stream.id, "Broadcast stopped");
        Ok(())
    }

    /// Resolve a shareable URL and join the stream as a listener.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown URL, `Rejected` for an ended stream or a
    /// refused join, `Transport` if no join completes in time.
    #[instrument(skip_all, name = "relay.client.join_as_listener", fields(stream_url = %stream_url))]
    pub async fn join_as_listener(&self, stream_url: &str) -> Result<ListenerSession, ClientError> {
        let stream = self.catalog.resolve_url(stream_url).await?;
        if !stream.is_active {
            return Err(ClientError::Rejected {
                code: ErrorCode::StreamNotActive,
                message: "Stream is not active".to_string(),
            });
        }

        let (client, role) = self.join(&stream.id).await?;
        info!(target: "relay.client", stream_id = %stream.id, role = %role, "Listening");
        Ok(ListenerSession { stream, client })
    }

    /// Leave a stream joined with [`join_as_listener`](Self::join_as_listener).
    pub async fn leave(&self, session: ListenerSession) {
        let stream_id = session.stream.id.clone();
        session.client.close().await;
        info!(target: "relay.client", stream_id = %stream_id, "Left stream");
    }

    /// Spawn a client and wait for its first `joined`.
    async fn join(&self, stream_id: &str) -> Result<(SignalingClient, PeerRole), ClientError> {
        let config = ClientConfig::new(stream_id, self.caller_id.clone())
            .with_backoff(self.backoff)
            .with_heartbeat_interval(self.heartbeat_interval);
        let mut client = SignalingClient::spawn(config, Arc::clone(&self.connector));

        let joined = tokio::time::timeout(self.join_timeout, async {
            loop {
                match client.next_event().await {
                    Some(ClientEvent::Connected { role, .. }) => return Ok(role),
                    Some(ClientEvent::Rejected { code, message }) => {
                        return Err(ClientError::Rejected { code, message })
                    }
                    Some(ClientEvent::Ended) | None => return Err(ClientError::Closed),
                    Some(_) => {}
                }
            }
        })
        .await;

        match joined {
            Ok(Ok(role)) => Ok((client, role)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::Transport(
                "timed out joining stream".to_string(),
            )),
        }
    }
}

/// A live broadcast. Dropping it leaves the stream without ending it.
pub struct BroadcastSession {
    stream: Stream,
    client: SignalingClient,
    audio: AudioSettings,
}

impl BroadcastSession {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream.id
    }

    /// Shareable URL token for listeners.
    #[must_use]
    pub fn stream_url(&self) -> &str {
        &self.stream.stream_url
    }

    #[must_use]
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    #[must_use]
    pub fn client(&self) -> &SignalingClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SignalingClient {
        &mut self.client
    }

    #[must_use]
    pub fn audio(&self) -> &AudioSettings {
        &self.audio
    }

    pub fn audio_mut(&mut self) -> &mut AudioSettings {
        &mut self.audio
    }
}

/// A joined listener. Dropping it leaves the stream.
pub struct ListenerSession {
    stream: Stream,
    client: SignalingClient,
}

impl ListenerSession {
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream.id
    }

    #[must_use]
    pub fn title(&self) -> &str {
        &self.stream.title
    }

    #[must_use]
    pub fn client(&self) -> &SignalingClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut SignalingClient {
        &mut self.client
    }
}
