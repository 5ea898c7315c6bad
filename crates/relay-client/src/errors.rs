//! Client error types.

use common::error::ProtocolError;
use common::protocol::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connecting to or writing to the relay failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The relay sent something the client could not decode.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The relay refused a request (`error` frame).
    #[error("Relay rejected request ({}): {}", .code.as_str(), .message)]
    Rejected { code: ErrorCode, message: String },

    /// The signaling client has stopped.
    #[error("Signaling client closed")]
    Closed,

    /// Stream registry call failed.
    #[error("Stream registry error ({status}): {message}")]
    Registry { status: u16, message: String },

    #[error("Stream not found: {0}")]
    NotFound(String),

    /// An audio knob outside its range.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
}

impl ClientError {
    /// True for failures a reconnect can fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Rejected { code, .. } => *code == ErrorCode::RelayUnavailable,
            ClientError::Registry { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Transport("reset".into()).is_transient());
        assert!(ClientError::Rejected {
            code: ErrorCode::RelayUnavailable,
            message: String::new(),
        }
        .is_transient());
        assert!(!ClientError::Rejected {
            code: ErrorCode::DuplicatePublisher,
            message: String::new(),
        }
        .is_transient());
        assert!(ClientError::Registry {
            status: 503,
            message: String::new(),
        }
        .is_transient());
        assert!(!ClientError::NotFound("s1".into()).is_transient());
    }
}
