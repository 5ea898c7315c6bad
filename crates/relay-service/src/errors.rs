//! Relay error types.
//!
//! Every error maps to a wire [`ErrorCode`] for relay connections and to an
//! HTTP status for the stream registry. Internal details are logged
//! server-side but not exposed to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::ProtocolError;
use common::protocol::ErrorCode;
use serde::Serialize;
use thiserror::Error;

/// Relay error type.
///
/// No variant is fatal to the process: each is scoped to one connection,
/// one stream, or one request.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed envelope or missing required field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A publisher is already connected to the stream.
    #[error("Stream {0} already has a connected publisher")]
    DuplicatePublisher(String),

    /// The stream does not exist, has not started, or has ended.
    #[error("Stream not active: {0}")]
    StreamNotActive(String),

    /// Transient storage or forwarding failure.
    #[error("Relay unavailable: {0}")]
    RelayUnavailable(String),

    /// Stream lifecycle operation on an unknown id.
    #[error("Stream not found: {0}")]
    NotFound(String),

    /// Stream title is empty or too long.
    #[error("Invalid title: {0}")]
    InvalidTitle(String),

    /// Request conflicts with the stream's state (e.g. reactivating an ended stream).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (actor channel failure, serialization, ...).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Returns the wire error code for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RelayError::Validation(_) | RelayError::InvalidTitle(_) => ErrorCode::ValidationError,
            RelayError::DuplicatePublisher(_) => ErrorCode::DuplicatePublisher,
            RelayError::StreamNotActive(_) | RelayError::Conflict(_) => ErrorCode::StreamNotActive,
            RelayError::RelayUnavailable(_) => ErrorCode::RelayUnavailable,
            RelayError::NotFound(_) => ErrorCode::NotFound,
            RelayError::Config(_) | RelayError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Validation(msg)
            | RelayError::InvalidTitle(msg)
            | RelayError::Conflict(msg) => msg.clone(),
            RelayError::DuplicatePublisher(_) => {
                "A publisher is already connected to this stream".to_string()
            }
            RelayError::StreamNotActive(_) => "Stream is not active".to_string(),
            RelayError::RelayUnavailable(_) => {
                "Signaling storage is temporarily unavailable".to_string()
            }
            RelayError::NotFound(_) => "Stream not found".to_string(),
            RelayError::Config(_) | RelayError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation",
            RelayError::DuplicatePublisher(_) => "duplicate_publisher",
            RelayError::StreamNotActive(_) => "stream_not_active",
            RelayError::RelayUnavailable(_) => "relay_unavailable",
            RelayError::NotFound(_) => "not_found",
            RelayError::InvalidTitle(_) => "invalid_title",
            RelayError::Conflict(_) => "conflict",
            RelayError::Config(_) => "config",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl From<ProtocolError> for RelayError {
    fn from(err: ProtocolError) -> Self {
        RelayError::Validation(err.to_string())
    }
}

/// JSON error body for the stream registry.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl RelayError {
    /// HTTP status for the stream registry.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::Validation(_) | RelayError::InvalidTitle(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Conflict(_) | RelayError::DuplicatePublisher(_) => StatusCode::CONFLICT,
            RelayError::StreamNotActive(_) => StatusCode::GONE,
            RelayError::RelayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Config(_) | RelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match &self {
            RelayError::RelayUnavailable(reason) => {
                // Log actual reason server-side
                tracing::warn!(target: "relay.availability", reason = %reason, "Relay unavailable");
            }
            RelayError::Config(err) | RelayError::Internal(err) => {
                tracing::error!(target: "relay.internal", error = %err, "Request failed");
            }
            _ => {}
        }
        let status = self.status_code();

        let body = ErrorResponse {
            error: self.client_message(),
        };

        (status, Json(body)).into_response()
    }
}
