//! Signal store and stream directory.
//!
//! The signal store keeps relayed envelopes per stream so late joiners can
//! catch up. Entries are immutable once written; they are removed only when
//! their sender leaves or the stream is torn down.

pub mod lua_scripts;
pub mod memory;
pub mod redis_store;
pub mod streams;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::protocol::{SignalEnvelope, SignalType};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

use crate::errors::RelayError;
use crate::observability::metrics;

pub use memory::InMemorySignalStore;
pub use redis_store::RedisSignalStore;
pub use streams::{StreamDirectory, StreamState};

/// Per-stream retention cap. Oldest entries are dropped first.
pub const MAX_SIGNALS_PER_STREAM: usize = 1024;

/// A relayed envelope as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSignal {
    pub stream_id: String,
    pub sender_id: String,
    pub receiver_id: Option<String>,
    pub signal_type: SignalType,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl StoredSignal {
    #[must_use]
    pub fn from_envelope(envelope: &SignalEnvelope) -> Self {
        Self {
            stream_id: envelope.stream_id.clone(),
            sender_id: envelope.sender_id.clone(),
            receiver_id: envelope.receiver_id.clone(),
            signal_type: envelope.signal_type,
            data: envelope.data.clone(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn to_envelope(&self) -> SignalEnvelope {
        SignalEnvelope {
            signal_type: self.signal_type,
            stream_id: self.stream_id.clone(),
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            data: self.data.clone(),
        }
    }

    /// True when this entry is an offer `peer_id` should see on join:
    /// not its own, and either broadcast or addressed to it.
    #[must_use]
    pub fn is_replayable_to(&self, peer_id: &str) -> bool {
        self.signal_type == SignalType::Offer
            && self.sender_id != peer_id
            && self
                .receiver_id
                .as_deref()
                .map_or(true, |receiver| receiver == peer_id)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        RelayError::RelayUnavailable(err.to_string())
    }
}

/// Durable record of relayed signaling envelopes, keyed by stream.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append an envelope to its stream's log.
    async fn append(&self, signal: StoredSignal) -> Result<(), StoreError>;

    /// Offers replayable to `peer_id`, most recent first, at most `limit`.
    async fn recent_offers(
        &self,
        stream_id: &str,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSignal>, StoreError>;

    /// Remove every envelope `sender_id` sent on `stream_id`. Returns the count removed.
    async fn purge_sender(&self, stream_id: &str, sender_id: &str) -> Result<usize, StoreError>;

    /// Remove every envelope of `stream_id`. Returns the count removed.
    async fn purge_stream(&self, stream_id: &str) -> Result<usize, StoreError>;
}

/// Run one store call with a deadline and record its latency.
pub async fn with_timeout<T, F>(
    operation: &'static str,
    timeout: Duration,
    fut: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let start = Instant::now();
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    };

    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_store_operation(operation, status, start.elapsed());
    result
}

/// Persist an envelope: one attempt, one synchronous retry, then give up.
pub async fn persist_with_retry(
    store: &dyn SignalStore,
    signal: &StoredSignal,
    timeout: Duration,
) -> Result<(), StoreError> {
    match with_timeout("append", timeout, store.append(signal.clone())).await {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!(
                target: "relay.store",
                stream_id = %signal.stream_id,
                sender_id = %signal.sender_id,
                error = %first,
                "Signal persist failed, retrying once"
            );
            with_timeout("append", timeout, store.append(signal.clone())).await
        }
    }
}

/// Purge a departed peer's envelopes, logging rather than propagating failure.
pub async fn purge_departed_peer(
    store: &dyn SignalStore,
    stream_id: &str,
    peer_id: &str,
    timeout: Duration,
) -> Result<usize, StoreError> {
    let result = with_timeout(
        "purge_sender",
        timeout,
        store.purge_sender(stream_id, peer_id),
    )
    .await;

    if let Err(e) = &result {
        warn!(
            target: "relay.store",
            stream_id = %stream_id,
            peer_id = %peer_id,
            error = %e,
            "Failed to purge departed peer's signals"
        );
    }
    result
}
