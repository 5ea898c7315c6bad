//! Actor model for the session registry.
//!
//! ```text
//! RegistryControllerActor (singleton per relay instance)
//! └── supervises N StreamActors
//!     └── StreamActor (one per live stream)
//!         ├── owns the peer set and grace timers
//!         └── fans frames out to N ConnectionActors
//!             └── ConnectionActor (one per relay connection)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per stream**: joins, leaves and listener counts for a stream
//!   are serialized by its actor; streams never contend with each other
//! - **Non-blocking fan-out**: a stream actor never awaits a peer's transport
//! - **CancellationToken propagation**: parent actors pass child tokens for graceful shutdown
//! - **Mailbox monitoring**: depth thresholds with metrics (Stream: 100/500, Connection: 50/200)
//!
//! # Modules
//!
//! - [`controller`] - `RegistryControllerActor` and the [`SessionRegistry`] handle
//! - [`stream`] - `StreamActor` per live stream
//! - [`connection`] - `ConnectionActor` per relay connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring and actor metrics

pub mod connection;
pub mod controller;
pub mod messages;
pub mod metrics;
pub mod stream;

// Re-export primary types
pub use connection::{ConnectionActor, ConnectionActorHandle, ConnectionSettings, FrameSink};
pub use controller::SessionRegistry;
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use stream::{StreamActor, StreamActorHandle, StreamSettings};
