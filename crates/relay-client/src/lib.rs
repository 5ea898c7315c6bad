//! Airwave relay client.
//!
//! Client side of the signaling relay:
//!
//! ```text
//! BroadcastControl                 start/stop a broadcast, listen, leave
//!   |-- StreamCatalog              stream registry (LocalCatalog / HttpCatalog)
//!   `-- SignalingClient            supervisor task per session
//!         `-- SignalingChannel     one connection (LocalChannel / WsChannel)
//! ```
//!
//! The supervisor joins, beats every heartbeat interval, and rejoins with
//! exponential backoff after a lost connection. [`audio::AudioSettings`]
//! carries the capture knobs for a broadcast session.

pub mod audio;
pub mod catalog;
pub mod channel;
pub mod client;
pub mod control;
pub mod errors;
pub mod local;
pub mod reconnect;
pub mod ws;

pub use audio::AudioSettings;
pub use catalog::{HttpCatalog, LocalCatalog, StreamCatalog};
pub use channel::{ChannelConnector, SignalingChannel};
pub use client::{ClientConfig, ClientEvent, SignalingClient, PENDING_CAPACITY};
pub use control::{BroadcastControl, BroadcastSession, ListenerSession};
pub use errors::ClientError;
pub use local::LocalConnector;
pub use reconnect::BackoffPolicy;
pub use ws::WsConnector;
