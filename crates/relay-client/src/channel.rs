//! Signaling channel abstraction.
//!
//! One [`SignalingChannel`] is one connection to the relay. A
//! [`ChannelConnector`] opens fresh channels, which is all the reconnect
//! supervisor needs. Two variants exist:
//!
//! - [`LocalConnector`](crate::local::LocalConnector): in-process relay,
//!   deterministic, can simulate network drops
//! - [`WsConnector`](crate::ws::WsConnector): WebSocket to a relay server

use crate::errors::ClientError;

use async_trait::async_trait;
use common::protocol::{ServerFrame, SignalEnvelope};

/// A duplex signaling connection.
#[async_trait]
pub trait SignalingChannel: Send {
    /// Send one envelope.
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), ClientError>;

    /// Next frame from the relay. `Ok(None)` once the relay closed the channel.
    ///
    /// Must be cancel-safe: the supervisor polls it inside `select!`.
    async fn recv(&mut self) -> Result<Option<ServerFrame>, ClientError>;

    /// Close code the relay sent, if it closed the channel.
    fn close_code(&mut self) -> Option<u16>;

    /// Close from the client side.
    async fn close(&mut self);
}

/// Opens new channels to the same relay.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError>;
}
