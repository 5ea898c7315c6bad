//! Service assembly.
//!
//! Wires the signal store, stream directory, session registry, lifecycle
//! manager and relay context into one [`RelayApp`]. Used by the binary and
//! by test harnesses so both run the same object graph.

use crate::actors::{ActorMetrics, SessionRegistry, StreamSettings};
use crate::config::Config;
use crate::errors::RelayError;
use crate::lifecycle::StreamLifecycleManager;
use crate::observability::HealthState;
use crate::relay::{RelayContext, RelaySettings};
use crate::routes::{self, AppState};
use crate::store::{InMemorySignalStore, RedisSignalStore, SignalStore, StreamDirectory};

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A fully wired relay instance.
#[derive(Clone)]
pub struct RelayApp {
    pub state: Arc<AppState>,
    pub health: Arc<HealthState>,
    pub directory: Arc<StreamDirectory>,
    /// Root token: cancelling it closes every relay connection.
    pub shutdown: CancellationToken,
}

impl RelayApp {
    /// Build the relay, connecting to Redis when `SIGNAL_STORE_URL` is set.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::RelayUnavailable` if the Redis store cannot be reached.
    pub async fn build(config: Config) -> Result<Self, RelayError> {
        let store: Arc<dyn SignalStore> = match &config.signal_store_url {
            Some(url) => {
                info!(target: "relay.store", "Connecting to Redis signal store");
                Arc::new(RedisSignalStore::connect(url.expose_secret()).await?)
            }
            None => {
                info!(target: "relay.store", "Using in-memory signal store");
                Arc::new(InMemorySignalStore::new())
            }
        };
        Ok(Self::with_store(config, store))
    }

    /// Build the relay around an existing signal store.
    ///
    /// Spawns the registry actor, so it must run inside a Tokio runtime.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn SignalStore>) -> Self {
        let directory = Arc::new(StreamDirectory::new());
        let metrics = ActorMetrics::new();

        let registry = SessionRegistry::spawn(
            config.instance_id.clone(),
            Arc::clone(&directory),
            Arc::clone(&store),
            StreamSettings {
                grace_period: config.disconnect_grace(),
                store_timeout: config.store_timeout(),
            },
            Arc::clone(&metrics),
        );

        let lifecycle = StreamLifecycleManager::new(
            Arc::clone(&directory),
            registry.clone(),
            Arc::clone(&store),
            config.store_timeout(),
        );

        let shutdown = registry.child_token();
        let relay = RelayContext {
            registry,
            store,
            settings: RelaySettings::from_config(&config),
            metrics,
            shutdown: shutdown.clone(),
        };

        Self {
            state: Arc::new(AppState {
                config,
                lifecycle,
                relay,
            }),
            health: Arc::new(HealthState::new()),
            directory,
            shutdown,
        }
    }

    /// HTTP router for this instance.
    #[must_use]
    pub fn router(&self, metrics_handle: PrometheusHandle) -> Router {
        routes::build_routes(
            Arc::clone(&self.state),
            Arc::clone(&self.health),
            metrics_handle,
        )
    }

    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.state.relay.registry
    }

    #[must_use]
    pub fn lifecycle(&self) -> &StreamLifecycleManager {
        &self.state.lifecycle
    }

    #[must_use]
    pub fn relay(&self) -> &RelayContext {
        &self.state.relay
    }

    /// Stop accepting work: readiness goes down, connections close with
    /// 1001 and the registry shuts its stream actors down.
    pub fn shutdown(&self) {
        self.health.set_not_ready();
        self.shutdown.cancel();
        self.state.relay.registry.shutdown();
    }
}
