//! Stream lifecycle manager.
//!
//! Source of truth for which streams exist and which are live. A stream
//! moves `Created -> Active -> Ended`; `Ended` is terminal and a restart
//! needs a new stream id.
//!
//! Starting a stream activates it in the [`StreamDirectory`] and opens its
//! session in the [`SessionRegistry`]. Ending it flips `is_active` first, so
//! no new peer can join, then tears the session down and purges the stream's
//! stored envelopes.

use crate::actors::SessionRegistry;
use crate::errors::RelayError;
use crate::store::{with_timeout, SignalStore, StreamDirectory, StreamState};

use chrono::Utc;
use common::protocol::MAX_ID_LEN;
use common::types::{Stream, StreamId, StreamUpdate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Maximum stream title length, in characters, after trimming.
pub const MAX_TITLE_CHARS: usize = 200;

/// Creates, lists, updates and ends streams.
#[derive(Clone)]
pub struct StreamLifecycleManager {
    directory: Arc<StreamDirectory>,
    registry: SessionRegistry,
    store: Arc<dyn SignalStore>,
    store_timeout: Duration,
}

impl StreamLifecycleManager {
    #[must_use]
    pub fn new(
        directory: Arc<StreamDirectory>,
        registry: SessionRegistry,
        store: Arc<dyn SignalStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            registry,
            store,
            store_timeout,
        }
    }

    /// Create a stream and make it live.
    ///
    /// # Errors
    ///
    /// `InvalidTitle` for an empty or overlong title, `Validation` for a bad
    /// broadcaster id, `RelayUnavailable` if the relay is shutting down.
    #[instrument(skip_all, name = "relay.lifecycle.create", fields(broadcaster_id = %broadcaster_id))]
    pub async fn create_stream(
        &self,
        title: &str,
        broadcaster_id: &str,
    ) -> Result<Stream, RelayError> {
        let title = validate_title(title)?;
        validate_broadcaster_id(broadcaster_id)?;

        let now = Utc::now();
        let stream = Stream {
            id: StreamId::new().to_string(),
            title,
            stream_url: generate_stream_url(),
            broadcaster_id: broadcaster_id.to_string(),
            is_active: false,
            listener_count: 0,
            created_at: now,
            updated_at: now,
        };

        let stream = self.directory.insert(stream).await?;
        let stream = self.directory.activate(&stream.id).await?;

        if let Err(e) = self
            .registry
            .open_stream(stream.id.clone(), stream.broadcaster_id.clone())
            .await
        {
            // Never leave an Active record without a session behind it
            let _ = self.directory.mark_ended(&stream.id).await;
            return Err(e);
        }

        info!(
            target: "relay.lifecycle",
            stream_id = %stream.id,
            stream_url = %stream.stream_url,
            "Stream started"
        );
        Ok(stream)
    }

    /// Active streams, newest first.
    pub async fn list_active_streams(&self) -> Vec<Stream> {
        self.directory.list_active().await
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<Stream, RelayError> {
        self.directory
            .get(stream_id)
            .await
            .ok_or_else(|| RelayError::NotFound(stream_id.to_string()))
    }

    /// Look a stream up by its shareable URL token.
    pub async fn resolve_url(&self, stream_url: &str) -> Result<Stream, RelayError> {
        self.directory
            .find_by_url(stream_url)
            .await
            .ok_or_else(|| RelayError::NotFound(stream_url.to_string()))
    }

    /// Apply a partial update.
    ///
    /// `title` renames the stream; `is_active: false` ends it. Every field is
    /// validated before anything changes.
    ///
    /// # Errors
    ///
    /// `NotFound`, `InvalidTitle`, `Validation` for an empty update, and
    /// `Conflict` for `is_active: true` on an ended stream.
    #[instrument(skip_all, name = "relay.lifecycle.update", fields(stream_id = %stream_id))]
    pub async fn update_stream(
        &self,
        stream_id: &str,
        update: StreamUpdate,
    ) -> Result<Stream, RelayError> {
        let state = self
            .directory
            .state(stream_id)
            .await
            .ok_or_else(|| RelayError::NotFound(stream_id.to_string()))?;

        if update.is_empty() {
            return Err(RelayError::Validation(
                "Update must include title or is_active".to_string(),
            ));
        }
        let title = update.title.as_deref().map(validate_title).transpose()?;
        if update.is_active == Some(true) && state == StreamState::Ended {
            return Err(RelayError::Conflict(
                "Stream has ended and cannot be reactivated".to_string(),
            ));
        }

        let mut stream = match title {
            Some(title) => self.directory.rename(stream_id, title).await?,
            None => self.get_stream(stream_id).await?,
        };
        if update.is_active == Some(false) {
            stream = self.end_stream(stream_id).await?;
        }
        Ok(stream)
    }

    /// End a stream: no new joins, every peer removed, stored envelopes purged.
    /// Ending an ended stream is a no-op success.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    #[instrument(skip_all, name = "relay.lifecycle.end", fields(stream_id = %stream_id))]
    pub async fn end_stream(&self, stream_id: &str) -> Result<Stream, RelayError> {
        let (stream, already_ended) = self.directory.mark_ended(stream_id).await?;
        if already_ended {
            return Ok(stream);
        }

        let peers_removed = match self.registry.close_stream(stream_id.to_string()).await {
            Ok(report) => report.peers_removed,
            Err(RelayError::NotFound(_)) => 0,
            Err(e) => {
                warn!(
                    target: "relay.lifecycle",
                    stream_id = %stream_id,
                    error = %e,
                    "Session teardown failed"
                );
                0
            }
        };
        // The session is gone; nothing else writes the count now
        self.directory.set_listener_count(stream_id, 0).await;

        let purge = with_timeout(
            "purge_stream",
            self.store_timeout,
            self.store.purge_stream(stream_id),
        )
        .await;
        if let Err(e) = purge {
            warn!(
                target: "relay.lifecycle",
                stream_id = %stream_id,
                error = %e,
                "Failed to purge stored signals for ended stream"
            );
        }

        info!(
            target: "relay.lifecycle",
            stream_id = %stream_id,
            peers_removed,
            "Stream ended"
        );
        self.get_stream(stream_id).await
    }
}

/// Trim and bound a title.
///
/// # Errors
///
/// `InvalidTitle` when empty after trimming or longer than [`MAX_TITLE_CHARS`].
pub fn validate_title(title: &str) -> Result<String, RelayError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(RelayError::InvalidTitle(
            "Stream title is required".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        return Err(RelayError::InvalidTitle(format!(
            "Stream title must be at most {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_broadcaster_id(broadcaster_id: &str) -> Result<(), RelayError> {
    if broadcaster_id.trim().is_empty() || broadcaster_id.len() > MAX_ID_LEN {
        return Err(RelayError::Validation(format!(
            "broadcaster_id must be 1 to {MAX_ID_LEN} bytes"
        )));
    }
    Ok(())
}

/// `stream-<unix millis>-<8 hex digits>`.
fn generate_stream_url() -> String {
    format!(
        "stream-{}-{:08x}",
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, StreamSettings};
    use crate::store::{InMemorySignalStore, StoredSignal};
    use common::protocol::{SignalEnvelope, SignalType};
    use serde_json::json;

    struct Fixture {
        manager: StreamLifecycleManager,
        registry: SessionRegistry,
        store: Arc<InMemorySignalStore>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(StreamDirectory::new());
        let store = Arc::new(InMemorySignalStore::new());
        let registry = SessionRegistry::spawn(
            "lifecycle-test".to_string(),
            Arc::clone(&directory),
            store.clone(),
            StreamSettings {
                grace_period: Duration::from_secs(30),
                store_timeout: Duration::from_secs(1),
            },
            ActorMetrics::new(),
        );
        let manager = StreamLifecycleManager::new(
            directory,
            registry.clone(),
            store.clone(),
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            registry,
            store,
        }
    }

    #[test]
    fn test_validate_title() {
        assert_eq!(validate_title("  Sunday Service ").unwrap(), "Sunday Service");
        assert!(matches!(validate_title("   "), Err(RelayError::InvalidTitle(_))));
        assert!(validate_title(&"a".repeat(MAX_TITLE_CHARS)).is_ok());
        assert!(validate_title(&"a".repeat(MAX_TITLE_CHARS + 1)).is_err());
    }

    #[test]
    fn test_stream_url_format() {
        let url = generate_stream_url();
        let parts: Vec<&str> = url.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "stream");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_create_stream_is_live_with_no_listeners() {
        let fx = fixture();
        let stream = fx
            .manager
            .create_stream("Sunday Service", "b1")
            .await
            .unwrap();

        assert!(stream.is_active);
        assert_eq!(stream.listener_count, 0);
        assert_eq!(stream.broadcaster_id, "b1");
        assert!(fx
            .registry
            .get_stream(stream.id.clone())
            .await
            .unwrap()
            .is_some());
        assert_eq!(
            fx.manager.resolve_url(&stream.stream_url).await.unwrap().id,
            stream.id
        );
    }

    #[tokio::test]
    async fn test_create_rejects_empty_title() {
        let fx = fixture();
        let result = fx.manager.create_stream("", "b1").await;
        assert!(matches!(result, Err(RelayError::InvalidTitle(_))));
        assert!(fx.manager.list_active_streams().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_active_newest_first() {
        let fx = fixture();
        let first = fx.manager.create_stream("First", "b1").await.unwrap();
        let second = fx.manager.create_stream("Second", "b2").await.unwrap();
        let third = fx.manager.create_stream("Third", "b3").await.unwrap();
        fx.manager.end_stream(&second.id).await.unwrap();

        let ids: Vec<String> = fx
            .manager
            .list_active_streams()
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![third.id, first.id]);
    }

    #[tokio::test]
    async fn test_end_stream_is_terminal_and_idempotent() {
        let fx = fixture();
        let stream = fx.manager.create_stream("Vespers", "b1").await.unwrap();
        fx.store
            .append(StoredSignal::from_envelope(
                &SignalEnvelope::new(SignalType::Offer, &stream.id, "b1")
                    .with_data(json!({"sdp": "v=0"})),
            ))
            .await
            .unwrap();

        let ended = fx.manager.end_stream(&stream.id).await.unwrap();
        assert!(!ended.is_active);
        assert_eq!(ended.listener_count, 0);
        assert_eq!(fx.store.len(&stream.id).await, 0);
        assert!(fx
            .registry
            .get_stream(stream.id.clone())
            .await
            .unwrap()
            .is_none());

        // Second end is a no-op success
        assert!(!fx.manager.end_stream(&stream.id).await.unwrap().is_active);

        let reactivate = fx
            .manager
            .update_stream(
                &stream.id,
                StreamUpdate {
                    title: None,
                    is_active: Some(true),
                },
            )
            .await;
        assert!(matches!(reactivate, Err(RelayError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_stream() {
        let fx = fixture();
        let stream = fx.manager.create_stream("Draft", "b1").await.unwrap();

        let renamed = fx
            .manager
            .update_stream(
                &stream.id,
                StreamUpdate {
                    title: Some(" Evening Mass ".to_string()),
                    is_active: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.title, "Evening Mass");
        assert!(renamed.is_active);

        let bad = fx
            .manager
            .update_stream(
                &stream.id,
                StreamUpdate {
                    title: Some(String::new()),
                    is_active: Some(false),
                },
            )
            .await;
        assert!(matches!(bad, Err(RelayError::InvalidTitle(_))));
        // Nothing changed when validation failed
        assert!(fx.manager.get_stream(&stream.id).await.unwrap().is_active);

        let ended = fx
            .manager
            .update_stream(
                &stream.id,
                StreamUpdate {
                    title: None,
                    is_active: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(!ended.is_active);

        let empty = fx
            .manager
            .update_stream(&stream.id, StreamUpdate::default())
            .await;
        assert!(matches!(empty, Err(RelayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unknown_stream_not_found() {
        let fx = fixture();
        assert!(matches!(
            fx.manager.get_stream("nope").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            fx.manager.end_stream("nope").await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            fx.manager
                .update_stream("nope", StreamUpdate::default())
                .await,
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            fx.manager.resolve_url("stream-0-00000000").await,
            Err(RelayError::NotFound(_))
        ));
    }
}
