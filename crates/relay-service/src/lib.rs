//! Airwave Relay Service Library
//!
//! Signaling relay and stream registry for live-audio broadcast:
//!
//! - Stream registry (create, list, rename, end) over a small REST surface
//! - Per-stream session registry with one publisher and many subscribers
//! - WebSocket signaling relay that stores, replays and fans out
//!   offers, answers and ICE candidates
//! - Heartbeat timeout and disconnect grace periods for dropped clients
//!
//! The relay never touches media. It only moves small JSON envelopes so
//! peers can establish a direct media path.
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry (controller actor, one per instance)
//! └── StreamActor (one per live stream, single writer for its peers)
//!     └── ConnectionActor (one per relay connection, owns the socket sink)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Session registry actor hierarchy
//! - [`relay`] - Per-connection signaling state machine and transports
//! - [`lifecycle`] - Stream lifecycle manager
//! - [`store`] - Signal store backends and stream directory
//! - [`handlers`] / [`routes`] - HTTP and WebSocket surface
//! - [`app`] - Wiring shared by the binary and test harnesses

pub mod actors;
pub mod app;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod lifecycle;
pub mod observability;
pub mod relay;
pub mod routes;
pub mod store;
