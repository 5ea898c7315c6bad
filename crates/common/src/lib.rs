//! Common types shared across Airwave components.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for the stream data model
pub mod types;

/// Module for the signaling wire protocol
pub mod protocol;
