//! Signaling wire protocol.
//!
//! One JSON object per frame over a persistent duplex connection. Clients send
//! [`SignalEnvelope`]s; the relay answers with [`ServerFrame`]s, which are
//! either forwarded envelopes or relay-generated [`ControlFrame`]s.
//!
//! ```json
//! { "type": "offer", "streamId": "...", "senderId": "...", "receiverId": "...", "data": {} }
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::PeerRole;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum accepted size of a single inbound frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Maximum length of `streamId`, `senderId` and `receiverId`.
pub const MAX_ID_LEN: usize = 128;

/// Close code: first frame on a connection was not `join-stream`.
pub const CLOSE_JOIN_REQUIRED: u16 = 4001;
/// Close code: a newer connection took over the same peer id.
pub const CLOSE_SUPERSEDED: u16 = 4002;
/// Close code: no frame received within the heartbeat timeout.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4003;
/// Close code: the stream was ended by its broadcaster.
pub const CLOSE_STREAM_ENDED: u16 = 4004;

/// Signaling message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    JoinStream,
    LeaveStream,
    /// Client liveness ping. Never stored or forwarded.
    Heartbeat,
}

impl SignalType {
    /// Returns the wire name, also used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
            SignalType::JoinStream => "join-stream",
            SignalType::LeaveStream => "leave-stream",
            SignalType::Heartbeat => "heartbeat",
        }
    }

    /// True for the session-description and candidate types the relay
    /// persists and forwards.
    #[must_use]
    pub const fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalType::Offer | SignalType::Answer | SignalType::IceCandidate
        )
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling envelope as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub signal_type: SignalType,
    pub stream_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SignalEnvelope {
    /// Build an envelope with no receiver and no payload.
    #[must_use]
    pub fn new(
        signal_type: SignalType,
        stream_id: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            signal_type,
            stream_id: stream_id.into(),
            sender_id: sender_id.into(),
            receiver_id: None,
            data: None,
        }
    }

    /// Address the envelope to a single peer.
    #[must_use]
    pub fn to_peer(mut self, receiver_id: impl Into<String>) -> Self {
        self.receiver_id = Some(receiver_id.into());
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode and validate a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the frame is oversized, is not a valid
    /// envelope, or fails [`SignalEnvelope::validate`].
    pub fn parse(text: &str) -> Result<Self> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: text.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        let envelope: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check required fields and identifier bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        check_id("streamId", &self.stream_id)?;
        check_id("senderId", &self.sender_id)?;

        if let Some(receiver_id) = &self.receiver_id {
            check_id("receiverId", receiver_id)?;
            if *receiver_id == self.sender_id {
                return Err(ProtocolError::InvalidField {
                    field: "receiverId",
                    reason: "must differ from senderId".to_string(),
                });
            }
        }

        if self.signal_type.is_relayed() && self.data.as_ref().map_or(true, |d| d.is_null()) {
            return Err(ProtocolError::MissingField("data"));
        }

        Ok(())
    }

    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the payload cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

fn check_id(field: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    if value.len() > MAX_ID_LEN {
        return Err(ProtocolError::InvalidField {
            field,
            reason: format!("longer than {MAX_ID_LEN} bytes"),
        });
    }
    Ok(())
}

/// Error codes carried in `error` and `warning` control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    JoinRequired,
    DuplicatePublisher,
    StreamNotActive,
    RelayUnavailable,
    NotFound,
    InternalError,
}

impl ErrorCode {
    /// Returns the wire name, also used as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::JoinRequired => "JOIN_REQUIRED",
            ErrorCode::DuplicatePublisher => "DUPLICATE_PUBLISHER",
            ErrorCode::StreamNotActive => "STREAM_NOT_ACTIVE",
            ErrorCode::RelayUnavailable => "RELAY_UNAVAILABLE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Why a peer left a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Explicit `leave-stream`.
    Voluntary,
    /// Connection dropped and the peer did not return within the grace period.
    Timeout,
    /// The stream was ended.
    StreamEnded,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Voluntary => "voluntary",
            LeaveReason::Timeout => "timeout",
            LeaveReason::StreamEnded => "stream-ended",
        }
    }
}

/// Frames generated by the relay itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlFrame {
    /// Join accepted. `replayed` stored offers follow.
    Joined {
        stream_id: String,
        peer_id: String,
        role: PeerRole,
        replayed: usize,
    },
    PeerJoined {
        stream_id: String,
        peer_id: String,
        role: PeerRole,
    },
    PeerLeft {
        stream_id: String,
        peer_id: String,
        reason: LeaveReason,
    },
    /// The request was rejected. The connection stays open.
    Error { code: ErrorCode, message: String },
    /// The request was accepted but something degraded.
    Warning { code: ErrorCode, message: String },
    HeartbeatAck,
    StreamEnded { stream_id: String },
}

impl ControlFrame {
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ControlFrame::Error {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(code: ErrorCode, message: impl Into<String>) -> Self {
        ControlFrame::Warning {
            code,
            message: message.into(),
        }
    }
}

/// Anything the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Signal(SignalEnvelope),
    Control(ControlFrame),
}

impl ServerFrame {
    /// Serialize for the wire.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the frame cannot be encoded.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Decode a frame received from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if the text is not a known frame.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::Signal(envelope) => envelope.signal_type.as_str(),
            ServerFrame::Control(ControlFrame::Joined { .. }) => "joined",
            ServerFrame::Control(ControlFrame::PeerJoined { .. }) => "peer-joined",
            ServerFrame::Control(ControlFrame::PeerLeft { .. }) => "peer-left",
            ServerFrame::Control(ControlFrame::Error { .. }) => "error",
            ServerFrame::Control(ControlFrame::Warning { .. }) => "warning",
            ServerFrame::Control(ControlFrame::HeartbeatAck) => "heartbeat-ack",
            ServerFrame::Control(ControlFrame::StreamEnded { .. }) => "stream-ended",
        }
    }
}

impl From<SignalEnvelope> for ServerFrame {
    fn from(envelope: SignalEnvelope) -> Self {
        ServerFrame::Signal(envelope)
    }
}

impl From<ControlFrame> for ServerFrame {
    fn from(frame: ControlFrame) -> Self {
        ServerFrame::Control(frame)
    }
}
