//! Common error types for Airwave components.

use thiserror::Error;

/// Errors raised while decoding or validating a signaling frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame could not be decoded as a signaling envelope
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// A required field is missing or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but its value is not acceptable
    #[error("Invalid field {field}: {reason}")]
    InvalidField {
        /// Wire name of the offending field
        field: &'static str,
        /// Human readable reason
        reason: String,
    },

    /// Frame exceeds the maximum accepted size
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Size of the rejected frame
        size: usize,
        /// Maximum accepted size
        max: usize,
    },
}

/// Result type alias using `ProtocolError`
pub type Result<T> = std::result::Result<T, ProtocolError>;
