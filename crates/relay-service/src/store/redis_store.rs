//! Redis-backed signal store.
//!
//! # Key Patterns
//!
//! - `airwave:stream:{id}:signals` - stream log (LIST of JSON entries, oldest first)
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently,
//! so each operation clones it instead of locking.

use super::lua_scripts;
use super::{SignalStore, StoreError, StoredSignal, MAX_SIGNALS_PER_STREAM};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, error, instrument, warn};

/// Signal store shared by every relay instance pointing at the same Redis.
#[derive(Clone)]
pub struct RedisSignalStore {
    connection: MultiplexedConnection,
    append_script: Script,
    purge_sender_script: Script,
    purge_stream_script: Script,
}

fn stream_key(stream_id: &str) -> String {
    format!("airwave:stream:{stream_id}:signals")
}

impl RedisSignalStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the URL is invalid or the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials
            error!(target: "relay.store.redis", error = %e, "Failed to open Redis client");
            StoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "relay.store.redis", error = %e, "Failed to connect to Redis");
                StoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            append_script: Script::new(lua_scripts::APPEND_SIGNAL),
            purge_sender_script: Script::new(lua_scripts::PURGE_SENDER),
            purge_stream_script: Script::new(lua_scripts::PURGE_STREAM),
        })
    }
}

#[async_trait]
impl SignalStore for RedisSignalStore {
    #[instrument(skip_all, fields(stream_id = %signal.stream_id))]
    async fn append(&self, signal: StoredSignal) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let json =
            serde_json::to_string(&signal).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let len: usize = self
            .append_script
            .key(stream_key(&signal.stream_id))
            .arg(json)
            .arg(MAX_SIGNALS_PER_STREAM)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("append failed: {e}")))?;

        debug!(target: "relay.store.redis", log_len = len, "Signal appended");
        Ok(())
    }

    #[instrument(skip_all, fields(stream_id = %stream_id))]
    async fn recent_offers(
        &self,
        stream_id: &str,
        peer_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSignal>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let entries: Vec<String> = conn
            .lrange(stream_key(stream_id), 0, -1)
            .await
            .map_err(|e| StoreError::Backend(format!("lrange failed: {e}")))?;

        let mut offers = Vec::with_capacity(limit);
        for entry in entries.iter().rev() {
            let signal: StoredSignal = match serde_json::from_str(entry) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(target: "relay.store.redis", error = %e, "Skipping undecodable entry");
                    continue;
                }
            };
            if signal.is_replayable_to(peer_id) {
                offers.push(signal);
                if offers.len() >= limit {
                    break;
                }
            }
        }
        Ok(offers)
    }

    #[instrument(skip_all, fields(stream_id = %stream_id))]
    async fn purge_sender(&self, stream_id: &str, sender_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        self.purge_sender_script
            .key(stream_key(stream_id))
            .arg(sender_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("purge_sender failed: {e}")))
    }

    #[instrument(skip_all, fields(stream_id = %stream_id))]
    async fn purge_stream(&self, stream_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        self.purge_stream_script
            .key(stream_key(stream_id))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("purge_stream failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_format() {
        assert_eq!(stream_key("abc"), "airwave:stream:abc:signals");
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let result = RedisSignalStore::connect("not-a-redis-url").await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }
}
