//! Stream directory: the record set behind the stream registry.
//!
//! Writers are the lifecycle manager (create, rename, end) and the
//! per-stream registry actors (listener counts). Locks are never held across
//! an await on anything other than the lock itself.

use chrono::Utc;
use common::types::Stream;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::RelayError;

/// Per-stream lifecycle state. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Active,
    Ended,
}

impl StreamState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamState::Created => "created",
            StreamState::Active => "active",
            StreamState::Ended => "ended",
        }
    }
}

#[derive(Debug)]
struct StreamRecord {
    stream: Stream,
    state: StreamState,
    /// Insertion order, breaks `created_at` ties when listing.
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, StreamRecord>,
    next_seq: u64,
}

/// In-memory stream records.
#[derive(Debug, Default)]
pub struct StreamDirectory {
    inner: RwLock<Inner>,
}

impl StreamDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new stream in the `Created` state.
    pub async fn insert(&self, mut stream: Stream) -> Result<Stream, RelayError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&stream.id) {
            return Err(RelayError::Conflict(format!(
                "Stream {} already exists",
                stream.id
            )));
        }

        stream.is_active = false;
        stream.listener_count = 0;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            stream.id.clone(),
            StreamRecord {
                stream: stream.clone(),
                state: StreamState::Created,
                seq,
            },
        );
        Ok(stream)
    }

    /// `Created -> Active`.
    pub async fn activate(&self, stream_id: &str) -> Result<Stream, RelayError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(stream_id)
            .ok_or_else(|| RelayError::NotFound(stream_id.to_string()))?;

        match record.state {
            StreamState::Created => {
                record.state = StreamState::Active;
                record.stream.is_active = true;
                record.stream.updated_at = Utc::now();
                Ok(record.stream.clone())
            }
            StreamState::Active => Ok(record.stream.clone()),
            StreamState::Ended => Err(RelayError::Conflict(
                "Stream has ended and cannot be reactivated".to_string(),
            )),
        }
    }

    /// Move a stream to `Ended`. Returns the stream and whether it was
    /// already ended before this call.
    pub async fn mark_ended(&self, stream_id: &str) -> Result<(Stream, bool), RelayError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(stream_id)
            .ok_or_else(|| RelayError::NotFound(stream_id.to_string()))?;

        let already_ended = record.state == StreamState::Ended;
        if !already_ended {
            record.state = StreamState::Ended;
            record.stream.is_active = false;
            record.stream.updated_at = Utc::now();
        }
        Ok((record.stream.clone(), already_ended))
    }

    /// Change the title. Allowed in any state.
    pub async fn rename(&self, stream_id: &str, title: String) -> Result<Stream, RelayError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(stream_id)
            .ok_or_else(|| RelayError::NotFound(stream_id.to_string()))?;

        record.stream.title = title;
        record.stream.updated_at = Utc::now();
        Ok(record.stream.clone())
    }

    /// Record the registry's subscriber count. Returns false for unknown ids.
    pub async fn set_listener_count(&self, stream_id: &str, count: u32) -> bool {
        let mut inner = self.inner.write().await;
        match inner.records.get_mut(stream_id) {
            Some(record) => {
                if record.stream.listener_count != count {
                    record.stream.listener_count = count;
                    record.stream.updated_at = Utc::now();
                }
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, stream_id: &str) -> Option<Stream> {
        self.inner
            .read()
            .await
            .records
            .get(stream_id)
            .map(|r| r.stream.clone())
    }

    pub async fn state(&self, stream_id: &str) -> Option<StreamState> {
        self.inner
            .read()
            .await
            .records
            .get(stream_id)
            .map(|r| r.state)
    }

    pub async fn is_active(&self, stream_id: &str) -> bool {
        self.state(stream_id).await == Some(StreamState::Active)
    }

    pub async fn find_by_url(&self, stream_url: &str) -> Option<Stream> {
        self.inner
            .read()
            .await
            .records
            .values()
            .find(|r| r.stream.stream_url == stream_url)
            .map(|r| r.stream.clone())
    }

    /// Active streams, newest first.
    pub async fn list_active(&self) -> Vec<Stream> {
        let inner = self.inner.read().await;
        let mut active: Vec<&StreamRecord> = inner
            .records
            .values()
            .filter(|r| r.state == StreamState::Active)
            .collect();
        active.sort_by(|a, b| {
            b.stream
                .created_at
                .cmp(&a.stream.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        active.into_iter().map(|r| r.stream.clone()).collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .read()
            .await
            .records
            .values()
            .filter(|r| r.state == StreamState::Active)
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn stream(id: &str) -> Stream {
        let now = Utc::now();
        Stream {
            id: id.to_string(),
            title: format!("Stream {id}"),
            stream_url: format!("stream-{id}"),
            broadcaster_id: "b1".to_string(),
            is_active: true,
            listener_count: 7,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_starts_created_and_inactive() {
        let directory = StreamDirectory::new();
        let created = directory.insert(stream("a")).await.unwrap();

        assert!(!created.is_active);
        assert_eq!(created.listener_count, 0);
        assert_eq!(directory.state("a").await, Some(StreamState::Created));
        assert!(directory.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let directory = StreamDirectory::new();
        directory.insert(stream("a")).await.unwrap();
        assert!(matches!(
            directory.insert(stream("a")).await,
            Err(RelayError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_is_one_way() {
        let directory = StreamDirectory::new();
        directory.insert(stream("a")).await.unwrap();

        let active = directory.activate("a").await.unwrap();
        assert!(active.is_active);

        let (ended, already) = directory.mark_ended("a").await.unwrap();
        assert!(!ended.is_active);
        assert!(!already);

        let (_, already) = directory.mark_ended("a").await.unwrap();
        assert!(already);

        assert!(matches!(
            directory.activate("a").await,
            Err(RelayError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let directory = StreamDirectory::new();
        assert!(matches!(
            directory.activate("x").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            directory.mark_ended("x").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(!directory.set_listener_count("x", 3).await);
        assert!(directory.get("x").await.is_none());
    }

    #[tokio::test]
    async fn test_list_active_newest_first() {
        let directory = StreamDirectory::new();
        for id in ["a", "b", "c"] {
            directory.insert(stream(id)).await.unwrap();
            directory.activate(id).await.unwrap();
        }
        directory.mark_ended("b").await.unwrap();

        let listed: Vec<String> = directory
            .list_active()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, vec!["c".to_string(), "a".to_string()]);
        assert_eq!(directory.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_listener_count_and_lookup_by_url() {
        let directory = StreamDirectory::new();
        directory.insert(stream("a")).await.unwrap();
        directory.activate("a").await.unwrap();

        assert!(directory.set_listener_count("a", 2).await);
        let found = directory.find_by_url("stream-a").await.unwrap();
        assert_eq!(found.listener_count, 2);
        assert!(directory.find_by_url("stream-zzz").await.is_none());
    }
}
