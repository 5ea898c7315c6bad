//! Envelope and stream fixtures.

use common::protocol::{SignalEnvelope, SignalType};
use serde_json::json;
use uuid::Uuid;

/// A stream the way tests want to create it.
#[derive(Debug, Clone)]
pub struct TestStream {
    pub title: String,
    pub broadcaster_id: String,
}

impl TestStream {
    #[must_use]
    pub fn new(title: impl Into<String>, broadcaster_id: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            broadcaster_id: broadcaster_id.into(),
        }
    }

    /// Random title and broadcaster id.
    #[must_use]
    pub fn random() -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self::new(format!("Test Stream {suffix}"), format!("host-{suffix}"))
    }
}

#[must_use]
pub fn join(stream_id: &str, peer_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::JoinStream, stream_id, peer_id)
}

#[must_use]
pub fn leave(stream_id: &str, peer_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::LeaveStream, stream_id, peer_id)
}

#[must_use]
pub fn heartbeat(stream_id: &str, peer_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::Heartbeat, stream_id, peer_id)
}

/// Broadcast offer with a minimal SDP body.
#[must_use]
pub fn offer(stream_id: &str, sender_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::Offer, stream_id, sender_id)
        .with_data(json!({ "type": "offer", "sdp": format!("v=0 o={sender_id}") }))
}

#[must_use]
pub fn answer(stream_id: &str, sender_id: &str, receiver_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::Answer, stream_id, sender_id)
        .to_peer(receiver_id)
        .with_data(json!({ "type": "answer", "sdp": format!("v=0 o={sender_id}") }))
}

#[must_use]
pub fn ice_candidate(stream_id: &str, sender_id: &str, receiver_id: &str) -> SignalEnvelope {
    SignalEnvelope::new(SignalType::IceCandidate, stream_id, sender_id)
        .to_peer(receiver_id)
        .with_data(json!({
            "candidate": "candidate:1 1 UDP 2122252543 192.0.2.10 49152 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
}
