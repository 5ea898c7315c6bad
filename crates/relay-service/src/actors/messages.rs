//! Message types for actor communication.
//!
//! Request/response messages carry a `oneshot` sender; notifications
//! (connection lost, heartbeat, grace expiry) are fire-and-forget.

use chrono::{DateTime, Utc};
use common::protocol::{ServerFrame, SignalEnvelope};
use common::types::PeerRole;
use tokio::sync::oneshot;

use super::connection::ConnectionActorHandle;
use super::stream::StreamActorHandle;
use crate::errors::RelayError;

// ============================================================================
// RegistryControllerActor Messages
// ============================================================================

/// Messages sent to the `RegistryControllerActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Start a stream actor for a newly activated stream.
    OpenStream {
        stream_id: String,
        broadcaster_id: String,
        respond_to: oneshot::Sender<Result<StreamActorHandle, RelayError>>,
    },

    GetStream {
        stream_id: String,
        respond_to: oneshot::Sender<Option<StreamActorHandle>>,
    },

    /// Tear the stream down; every peer is removed as an implicit leave.
    CloseStream {
        stream_id: String,
        respond_to: oneshot::Sender<Result<TeardownReport, RelayError>>,
    },

    ListStreams {
        respond_to: oneshot::Sender<Vec<StreamActorHandle>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}

/// Registry-wide status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub active_streams: usize,
    pub is_shutting_down: bool,
}

// ============================================================================
// StreamActor Messages
// ============================================================================

/// Messages sent to a `StreamActor`.
#[derive(Debug)]
pub enum StreamMessage {
    Join {
        peer_id: String,
        role: PeerRole,
        connection: ConnectionActorHandle,
        respond_to: oneshot::Sender<Result<JoinOutcome, RelayError>>,
    },

    /// Explicit `leave-stream`. Idempotent.
    Leave {
        peer_id: String,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    /// The peer's connection dropped without a leave. Starts the grace timer.
    ConnectionLost {
        peer_id: String,
        connection_id: String,
    },

    /// A grace timer fired. Stale epochs are ignored.
    GraceExpired { peer_id: String, epoch: u64 },

    Heartbeat {
        peer_id: String,
        connection_id: String,
    },

    Forward {
        envelope: SignalEnvelope,
        respond_to: oneshot::Sender<Result<ForwardReport, RelayError>>,
    },

    ListPeers {
        excluding: Option<String>,
        respond_to: oneshot::Sender<Vec<String>>,
    },

    IsConnected {
        peer_id: String,
        respond_to: oneshot::Sender<bool>,
    },

    GetState {
        respond_to: oneshot::Sender<StreamSnapshot>,
    },

    /// Remove every peer and stop the actor.
    Teardown {
        respond_to: oneshot::Sender<TeardownReport>,
    },
}

/// How a join was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// New peer; others were notified.
    Joined,
    /// Same peer returned within its grace period; nobody was notified.
    Resumed,
    /// Same subscriber id joined from a new connection; the old one was closed.
    Superseded,
}

impl JoinKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Joined => "joined",
            JoinKind::Resumed => "resumed",
            JoinKind::Superseded => "superseded",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    pub role: PeerRole,
    pub kind: JoinKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// False when the peer was not registered (repeat leave).
    pub removed: bool,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardReport {
    pub delivered: usize,
    /// Recipients whose mailbox was full or closed.
    pub dropped: usize,
    /// `receiverId` was set but that peer is not currently connected.
    pub target_offline: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub peers_removed: usize,
}

/// Connection status of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    /// Connection dropped; grace timer running.
    Disconnected,
}

/// Point-in-time view of one peer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub stream_id: String,
    pub role: PeerRole,
    pub status: PeerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Point-in-time view of a stream's registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub stream_id: String,
    pub broadcaster_id: String,
    pub peers: Vec<PeerSnapshot>,
    pub listener_count: u32,
}

// ============================================================================
// ConnectionActor Messages
// ============================================================================

/// Messages sent to a `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write one frame to the client.
    Send { frame: ServerFrame },

    /// Close the transport with a close code.
    Close { code: u16, reason: String },
}
