//! Relay service configuration.
//!
//! Everything is read from environment variables. Only `SIGNAL_STORE_URL`
//! is sensitive; when it is absent the in-memory signal store is used.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default bind address for the HTTP/WebSocket listener.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default client heartbeat interval (seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_SECONDS: u64 = 15;

/// Default heartbeat timeout (seconds). Three missed intervals.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 45;

/// Default grace period before a dropped connection becomes a leave (seconds).
pub const DEFAULT_DISCONNECT_GRACE_SECONDS: u64 = 30;

/// Default number of stored offers replayed to a joining peer.
pub const DEFAULT_OFFER_REPLAY_LIMIT: usize = 10;

/// Upper bound for the replay window.
pub const MAX_OFFER_REPLAY_LIMIT: usize = 100;

/// Default timeout for a single signal store call (milliseconds).
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2000;

/// Default timeout for a single write to a client socket (milliseconds).
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5000;

/// Default outbound mailbox capacity per connection.
pub const DEFAULT_CONNECTION_MAILBOX: usize = 256;

/// Relay configuration.
#[derive(Clone)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to.
    pub bind_address: String,

    /// Unique identifier for this relay instance (logs only).
    pub instance_id: String,

    /// Redis URL for the signal store. `None` selects the in-memory store.
    pub signal_store_url: Option<SecretString>,

    /// Interval clients are expected to heartbeat at (seconds).
    pub heartbeat_interval_seconds: u64,

    /// Silence after which a connection is considered dropped (seconds).
    pub heartbeat_timeout_seconds: u64,

    /// Grace period before a dropped peer is removed (seconds).
    pub disconnect_grace_seconds: u64,

    /// Maximum stored offers replayed on join.
    pub offer_replay_limit: usize,

    /// Timeout for each signal store call (milliseconds).
    pub store_timeout_ms: u64,

    /// Timeout for each socket write (milliseconds).
    pub send_timeout_ms: u64,

    /// Outbound mailbox capacity per connection.
    pub connection_mailbox: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("instance_id", &self.instance_id)
            .field(
                "signal_store_url",
                &self.signal_store_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "heartbeat_interval_seconds",
                &self.heartbeat_interval_seconds,
            )
            .field("heartbeat_timeout_seconds", &self.heartbeat_timeout_seconds)
            .field("disconnect_grace_seconds", &self.disconnect_grace_seconds)
            .field("offer_replay_limit", &self.offer_replay_limit)
            .field("store_timeout_ms", &self.store_timeout_ms)
            .field("send_timeout_ms", &self.send_timeout_ms)
            .field("connection_mailbox", &self.connection_mailbox)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RELAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let instance_id = vars
            .get("RELAY_INSTANCE_ID")
            .cloned()
            .unwrap_or_else(|| format!("relay-{}", uuid::Uuid::new_v4()));

        let signal_store_url = vars
            .get("SIGNAL_STORE_URL")
            .filter(|url| !url.trim().is_empty())
            .map(|url| SecretString::from(url.clone()));

        let heartbeat_interval_seconds = parse_positive(
            vars,
            "RELAY_HEARTBEAT_INTERVAL_SECONDS",
            DEFAULT_HEARTBEAT_INTERVAL_SECONDS,
        )?;

        let heartbeat_timeout_seconds = parse_positive(
            vars,
            "RELAY_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;

        if heartbeat_timeout_seconds <= heartbeat_interval_seconds {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_HEARTBEAT_TIMEOUT_SECONDS ({heartbeat_timeout_seconds}) must exceed \
                 RELAY_HEARTBEAT_INTERVAL_SECONDS ({heartbeat_interval_seconds})"
            )));
        }

        let disconnect_grace_seconds = vars
            .get("RELAY_DISCONNECT_GRACE_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_DISCONNECT_GRACE_SECONDS);

        let offer_replay_limit = parse_positive(
            vars,
            "RELAY_OFFER_REPLAY_LIMIT",
            DEFAULT_OFFER_REPLAY_LIMIT,
        )?;
        if offer_replay_limit > MAX_OFFER_REPLAY_LIMIT {
            return Err(ConfigError::InvalidValue(format!(
                "RELAY_OFFER_REPLAY_LIMIT must be at most {MAX_OFFER_REPLAY_LIMIT}, got {offer_replay_limit}"
            )));
        }

        let store_timeout_ms =
            parse_positive(vars, "RELAY_STORE_TIMEOUT_MS", DEFAULT_STORE_TIMEOUT_MS)?;

        let send_timeout_ms =
            parse_positive(vars, "RELAY_SEND_TIMEOUT_MS", DEFAULT_SEND_TIMEOUT_MS)?;

        let connection_mailbox = parse_positive(
            vars,
            "RELAY_CONNECTION_MAILBOX",
            DEFAULT_CONNECTION_MAILBOX,
        )?;

        Ok(Config {
            bind_address,
            instance_id,
            signal_store_url,
            heartbeat_interval_seconds,
            heartbeat_timeout_seconds,
            disconnect_grace_seconds,
            offer_replay_limit,
            store_timeout_ms,
            send_timeout_ms,
            connection_mailbox,
        })
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_seconds)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Parse a strictly positive numeric variable, falling back to `default`
/// when unset. Present-but-invalid values are an error rather than a silent
/// default.
fn parse_positive<T>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default + Copy,
{
    let Some(raw) = vars.get(key) else {
        return Ok(default);
    };

    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => Ok(value),
        _ => Err(ConfigError::InvalidValue(format!(
            "{key} must be a positive integer, got '{raw}'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "RELAY_INSTANCE_ID".to_string(),
            "relay-test-1".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_defaults() {
        let config = Config::from_vars(&base_vars()).unwrap();

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.instance_id, "relay-test-1");
        assert!(config.signal_store_url.is_none());
        assert_eq!(config.heartbeat_interval_seconds, 15);
        assert_eq!(config.heartbeat_timeout_seconds, 45);
        assert_eq!(config.disconnect_grace_seconds, 30);
        assert_eq!(config.offer_replay_limit, 10);
        assert_eq!(config.store_timeout(), Duration::from_millis(2000));
        assert_eq!(config.send_timeout(), Duration::from_millis(5000));
        assert_eq!(config.connection_mailbox, 256);
    }

    #[test]
    fn test_generated_instance_id() {
        let config = Config::from_vars(&HashMap::new()).unwrap();
        assert!(config.instance_id.starts_with("relay-"));
    }

    #[test]
    fn test_from_vars_overrides() {
        let mut vars = base_vars();
        vars.insert("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert(
            "SIGNAL_STORE_URL".to_string(),
            "redis://localhost:6379".to_string(),
        );
        vars.insert("RELAY_HEARTBEAT_INTERVAL_SECONDS".to_string(), "5".to_string());
        vars.insert("RELAY_HEARTBEAT_TIMEOUT_SECONDS".to_string(), "20".to_string());
        vars.insert("RELAY_DISCONNECT_GRACE_SECONDS".to_string(), "0".to_string());
        vars.insert("RELAY_OFFER_REPLAY_LIMIT".to_string(), "3".to_string());

        let config = Config::from_vars(&vars).unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(
            config.signal_store_url.as_ref().unwrap().expose_secret(),
            "redis://localhost:6379"
        );
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(20));
        assert_eq!(config.disconnect_grace(), Duration::ZERO);
        assert_eq!(config.offer_replay_limit, 3);
    }

    #[test]
    fn test_empty_store_url_means_in_memory() {
        let mut vars = base_vars();
        vars.insert("SIGNAL_STORE_URL".to_string(), "  ".to_string());

        let config = Config::from_vars(&vars).unwrap();
        assert!(config.signal_store_url.is_none());
    }

    #[test]
    fn test_timeout_must_exceed_interval() {
        let mut vars = base_vars();
        vars.insert("RELAY_HEARTBEAT_INTERVAL_SECONDS".to_string(), "30".to_string());
        vars.insert("RELAY_HEARTBEAT_TIMEOUT_SECONDS".to_string(), "30".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        for (key, value) in [
            ("RELAY_OFFER_REPLAY_LIMIT", "0"),
            ("RELAY_OFFER_REPLAY_LIMIT", "500"),
            ("RELAY_STORE_TIMEOUT_MS", "soon"),
            ("RELAY_CONNECTION_MAILBOX", "-1"),
        ] {
            let mut vars = base_vars();
            vars.insert(key.to_string(), value.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_debug_redacts_store_url() {
        let mut vars = base_vars();
        vars.insert(
            "SIGNAL_STORE_URL".to_string(),
            "redis://:hunter2@localhost:6379".to_string(),
        );

        let config = Config::from_vars(&vars).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("hunter2"));
    }
}
