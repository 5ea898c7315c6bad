//! HTTP request handlers for the relay.

pub mod metrics;
pub mod relay;
pub mod streams;

pub use metrics::metrics_handler;
pub use relay::signal_upgrade;
pub use streams::{
    create_stream, end_stream, get_stream, get_stream_by_url, list_streams, update_stream,
    ANONYMOUS_CALLER, CALLER_ID_HEADER,
};
