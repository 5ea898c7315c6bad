//! Signal store mock with failure and latency injection.
//!
//! Wraps the real in-memory store so reads and writes behave normally,
//! and adds knobs to exercise the relay's timeout and retry paths.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_test_utils::MockSignalStore;
//!
//! let store = MockSignalStore::new();
//! store.fail_next_appends(1);       // first persist fails, retry succeeds
//! store.set_latency(Duration::from_secs(10)); // every call times out
//! ```

use async_trait::async_trait;
use relay_service::store::{InMemorySignalStore, SignalStore, StoreError, StoredSignal};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Signal store for tests.
#[derive(Debug, Default)]
pub struct MockSignalStore {
    inner: InMemorySignalStore,
    fail_appends: AtomicUsize,
    fail_all: AtomicBool,
    latency: Mutex<Option<Duration>>,
    append_calls: AtomicUsize,
    purge_sender_calls: AtomicUsize,
    purge_stream_calls: AtomicUsize,
}

impl MockSignalStore {
    /// Create an empty store that behaves like the in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends with a backend error.
    pub fn fail_next_appends(&self, count: usize) {
        self.fail_appends.store(count, Ordering::SeqCst);
    }

    /// Fail every call until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn clear_latency(&self) {
        *self.latency.lock().unwrap() = None;
    }

    /// Number of append calls, including failed ones.
    pub fn append_calls(&self) -> usize {
        self.append_calls.load(Ordering::SeqCst)
    }

    pub fn purge_sender_calls(&self) -> usize {
        self.purge_sender_calls.load(Ordering::SeqCst)
    }

    pub fn purge_stream_calls(&self) -> usize {
        self.purge_stream_calls.load(Ordering::SeqCst)
    }

    /// Envelopes currently held for a stream.
    pub async fn stored(&self, stream_id: &str) -> usize {
        self.inner.len(stream_id).await
    }

    async fn before_call(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalStore for MockSignalStore {
    async fn append(&self, signal: StoredSignal) -> Result<(), StoreError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;

        let injected = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Backend("injected append failure".to_string()));
        }
        self.inner.append(signal).await
    }

    async fn recent_offers(
        &self,
        stream_id: &str,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSignal>, StoreError> {
        self.before_call().await?;
        self.inner.recent_offers(stream_id, peer_id, limit).await
    }

    async fn purge_sender(&self, stream_id: &str, sender_id: &str) -> Result<usize, StoreError> {
        self.purge_sender_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.inner.purge_sender(stream_id, sender_id).await
    }

    async fn purge_stream(&self, stream_id: &str) -> Result<usize, StoreError> {
        self.purge_stream_calls.fetch_add(1, Ordering::SeqCst);
        self.before_call().await?;
        self.inner.purge_stream(stream_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::offer;

    #[tokio::test]
    async fn test_fail_next_appends_then_recovers() {
        let store = MockSignalStore::new();
        store.fail_next_appends(1);

        let signal = StoredSignal::from_envelope(&offer("s1", "b1"));
        assert!(store.append(signal.clone()).await.is_err());
        assert!(store.append(signal).await.is_ok());
        assert_eq!(store.append_calls(), 2);
        assert_eq!(store.stored("s1").await, 1);
    }

    #[tokio::test]
    async fn test_failing_store_rejects_reads() {
        let store = MockSignalStore::new();
        store.set_failing(true);
        assert!(store.recent_offers("s1", "l1", 10).await.is_err());

        store.set_failing(false);
        assert!(store.recent_offers("s1", "l1", 10).await.unwrap().is_empty());
    }
}
