//! # Relay Test Utilities
//!
//! Shared test utilities for the Airwave relay.
//!
//! ## Modules
//!
//! - `mock_store` - Signal store with failure and latency injection
//! - `fixtures` - Envelope builders and stream fixtures
//! - `server_harness` - In-process relay and TCP test server
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let relay = TestRelay::new();
//!     let stream = relay.create_stream(&TestStream::new("Sunday Service", "host-1")).await;
//!
//!     let mut listener = relay.connect();
//!     listener.send(&join(&stream.id, "listener-a")).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod mock_store;
pub mod server_harness;

pub use fixtures::*;
pub use mock_store::*;
pub use server_harness::*;
