//! Signaling relay.
//!
//! One [`session::RelaySession`] per client connection, driven by
//! [`Inbound`] events. The transport adapters in [`transport`] turn a
//! WebSocket into those events; [`local`] does the same for in-process
//! clients so tests and local tooling run the exact same state machine.

pub mod local;
pub mod session;
pub mod transport;

use crate::actors::{ActorMetrics, ConnectionSettings, SessionRegistry};
use crate::config::Config;
use crate::store::SignalStore;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use local::{connect_local, LocalConnection};
pub use session::RelaySession;
pub use transport::{serve_websocket, ChannelFrameSink, WsFrameSink};

/// Inbound event from a client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// One text frame.
    Text(String),
    /// Transport-level liveness (ping, pong) with no payload for the relay.
    Activity,
    /// The client went away without a `leave-stream`.
    Closed,
}

/// Per-connection tunables, derived from [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    pub heartbeat_timeout: Duration,
    pub store_timeout: Duration,
    pub offer_replay_limit: usize,
    pub connection: ConnectionSettings,
}

impl RelaySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            store_timeout: config.store_timeout(),
            offer_replay_limit: config.offer_replay_limit,
            connection: ConnectionSettings {
                mailbox_capacity: config.connection_mailbox,
                send_timeout: config.send_timeout(),
            },
        }
    }
}

/// Everything a relay session needs, passed explicitly to each connection.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: SessionRegistry,
    pub store: Arc<dyn SignalStore>,
    pub settings: RelaySettings,
    pub metrics: Arc<ActorMetrics>,
    /// Cancelled on server shutdown; each connection takes a child token.
    pub shutdown: CancellationToken,
}
