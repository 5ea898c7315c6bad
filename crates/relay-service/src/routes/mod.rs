//! HTTP routes for the relay.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::lifecycle::StreamLifecycleManager;
use crate::observability::{health_router, HealthState};
use crate::relay::RelayContext;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for every HTTP route. Upgraded relay connections are
/// not subject to it once the upgrade completes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub lifecycle: StreamLifecycleManager,
    /// Shared by every relay connection.
    pub relay: RelayContext,
}

/// Build the application routes.
///
/// - `/streams`, `/streams/:id`, `/streams/by-url/:stream_url` - stream registry
/// - `/signal` - relay WebSocket
/// - `/health`, `/ready` - probes
/// - `/metrics` - Prometheus scrape
/// - TraceLayer for request logging
/// - 30 second request timeout
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let api_routes = Router::new()
        .route(
            "/streams",
            get(handlers::list_streams).post(handlers::create_stream),
        )
        .route(
            "/streams/by-url/:stream_url",
            get(handlers::get_stream_by_url),
        )
        .route(
            "/streams/:id",
            get(handlers::get_stream)
                .put(handlers::update_stream)
                .delete(handlers::end_stream),
        )
        .route("/signal", get(handlers::signal_upgrade))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    api_routes
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
