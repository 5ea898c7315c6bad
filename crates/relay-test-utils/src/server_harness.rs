//! Relay harnesses.
//!
//! - [`TestRelay`] wires a full relay in process around a [`MockSignalStore`].
//!   Clients connect through `connect_local`, so timing is deterministic and
//!   works under `start_paused`.
//! - [`TestRelayServer`] serves the real router on an ephemeral port for
//!   tests that need HTTP or WebSocket clients.
//!
//! # Example
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_health() -> anyhow::Result<()> {
//!     let server = TestRelayServer::spawn().await?;
//!     let response = reqwest::get(format!("{}/health", server.url())).await?;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

use crate::fixtures::TestStream;
use crate::mock_store::MockSignalStore;

use axum::Router;
use common::types::Stream;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay_service::app::RelayApp;
use relay_service::config::Config;
use relay_service::relay::{connect_local, LocalConnection};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Config for tests: fixed instance id, short store timeout, any overrides applied last.
pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars = HashMap::from([
        ("RELAY_INSTANCE_ID".to_string(), "relay-test".to_string()),
        ("RELAY_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ("RELAY_STORE_TIMEOUT_MS".to_string(), "500".to_string()),
    ]);
    for (key, value) in overrides {
        vars.insert((*key).to_string(), (*value).to_string());
    }
    Config::from_vars(&vars).expect("test config must be valid")
}

/// Prometheus handle that is not installed globally, so every test can have one.
pub fn test_metrics_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// In-process relay.
pub struct TestRelay {
    app: RelayApp,
    store: Arc<MockSignalStore>,
}

impl TestRelay {
    /// Relay with default test config.
    pub fn new() -> Self {
        Self::with_config(test_config(&[]))
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MockSignalStore::new());
        let app = RelayApp::with_store(config, store.clone());
        Self { app, store }
    }

    pub fn app(&self) -> &RelayApp {
        &self.app
    }

    pub fn store(&self) -> &MockSignalStore {
        &self.store
    }

    /// Router with a private metrics handle.
    pub fn router(&self) -> Router {
        self.app.router(test_metrics_handle())
    }

    /// Create and activate a stream.
    pub async fn create_stream(&self, stream: &TestStream) -> Stream {
        self.app
            .lifecycle()
            .create_stream(&stream.title, &stream.broadcaster_id)
            .await
            .expect("create_stream failed")
    }

    /// Current record for a stream.
    pub async fn stream(&self, stream_id: &str) -> Stream {
        self.app
            .lifecycle()
            .get_stream(stream_id)
            .await
            .expect("stream not found")
    }

    /// Open an in-process relay connection.
    pub fn connect(&self) -> LocalConnection {
        connect_local(self.app.relay())
    }
}

impl Default for TestRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.app.shutdown();
    }
}

/// Relay served over TCP on 127.0.0.1 with an ephemeral port.
pub struct TestRelayServer {
    addr: SocketAddr,
    app: RelayApp,
    store: Arc<MockSignalStore>,
    _handle: JoinHandle<()>,
}

impl TestRelayServer {
    /// Spawn a server with default test config.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with_config(test_config(&[])).await
    }

    pub async fn spawn_with_config(config: Config) -> Result<Self, anyhow::Error> {
        let store = Arc::new(MockSignalStore::new());
        let app = RelayApp::with_store(config, store.clone());
        let router = app.router(test_metrics_handle());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        app.health.set_ready();

        let shutdown = app.shutdown.clone();
        let handle = tokio::spawn(async move {
            let make_service = router.into_make_service_with_connect_info::<SocketAddr>();
            let server = axum::serve(listener, make_service)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            app,
            store,
            _handle: handle,
        })
    }

    /// Base HTTP URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL of the relay endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/signal", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn app(&self) -> &RelayApp {
        &self.app
    }

    pub fn store(&self) -> &MockSignalStore {
        &self.store
    }
}

impl Drop for TestRelayServer {
    fn drop(&mut self) {
        self.app.shutdown();
        self._handle.abort();
    }
}
