//! In-process signal store.
//!
//! Each stream gets its own shard so appends on different streams never
//! contend on the same lock. The outer map lock is only held long enough to
//! find or create a shard.

use super::{SignalStore, StoreError, StoredSignal, MAX_SIGNALS_PER_STREAM};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

type Shard = Arc<Mutex<VecDeque<StoredSignal>>>;

/// Signal store backed by process memory. Lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySignalStore {
    shards: RwLock<HashMap<String, Shard>>,
}

impl InMemorySignalStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn shard(&self, stream_id: &str) -> Option<Shard> {
        self.shards.read().await.get(stream_id).cloned()
    }

    async fn shard_or_create(&self, stream_id: &str) -> Shard {
        if let Some(shard) = self.shard(stream_id).await {
            return shard;
        }
        let mut shards = self.shards.write().await;
        Arc::clone(shards.entry(stream_id.to_string()).or_default())
    }

    /// Number of envelopes held for a stream.
    pub async fn len(&self, stream_id: &str) -> usize {
        match self.shard(stream_id).await {
            Some(shard) => shard.lock().await.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl SignalStore for InMemorySignalStore {
    async fn append(&self, signal: StoredSignal) -> Result<(), StoreError> {
        let shard = self.shard_or_create(&signal.stream_id).await;
        let mut entries = shard.lock().await;
        entries.push_back(signal);
        while entries.len() > MAX_SIGNALS_PER_STREAM {
            entries.pop_front();
        }
        Ok(())
    }

    async fn recent_offers(
        &self,
        stream_id: &str,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSignal>, StoreError> {
        let Some(shard) = self.shard(stream_id).await else {
            return Ok(Vec::new());
        };
        let entries = shard.lock().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|signal| signal.is_replayable_to(peer_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn purge_sender(&self, stream_id: &str, sender_id: &str) -> Result<usize, StoreError> {
        let Some(shard) = self.shard(stream_id).await else {
            return Ok(0);
        };
        let mut entries = shard.lock().await;
        let before = entries.len();
        entries.retain(|signal| signal.sender_id != sender_id);
        let removed = before - entries.len();

        debug!(
            target: "relay.store",
            stream_id = %stream_id,
            sender_id = %sender_id,
            removed,
            "Purged sender signals"
        );
        Ok(removed)
    }

    async fn purge_stream(&self, stream_id: &str) -> Result<usize, StoreError> {
        let removed = self.shards.write().await.remove(stream_id);
        let count = match removed {
            Some(shard) => shard.lock().await.len(),
            None => 0,
        };
        Ok(count)
    }
}
