//! Liveness and readiness probes.
//!
//! The relay moves through three phases: `starting` until the listener is
//! bound, `serving` while it accepts connections, and `draining` once
//! shutdown begins. `/health` answers 200 in every phase; `/ready` only
//! while serving. Both return `{"status": ..., "phase": ...}`.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Serving,
    Draining,
}

impl Phase {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Phase::Starting,
            1 => Phase::Serving,
            _ => Phase::Draining,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Serving => 1,
            Phase::Draining => 2,
        }
    }
}

#[derive(Debug)]
pub struct HealthState {
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Starting.as_u8()),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Listener bound. Ignored once draining.
    pub fn set_ready(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Starting.as_u8(),
            Phase::Serving.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Shutdown started. Final.
    pub fn set_not_ready(&self) {
        self.phase.store(Phase::Draining.as_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Serving
    }
}

#[derive(Debug, Serialize)]
struct ProbeResponse {
    status: &'static str,
    phase: Phase,
}

pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(health_state)
}

async fn liveness(State(state): State<Arc<HealthState>>) -> Json<ProbeResponse> {
    Json(ProbeResponse {
        status: "ok",
        phase: state.phase(),
    })
}

async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, Json<ProbeResponse>) {
    let phase = state.phase();
    if phase == Phase::Serving {
        (StatusCode::OK, Json(ProbeResponse { status: "ready", phase }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ProbeResponse {
                status: "not_ready",
                phase,
            }),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    async fn probe(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_draining_is_final() {
        let state = HealthState::new();
        assert_eq!(state.phase(), Phase::Starting);
        state.set_ready();
        assert!(state.is_ready());
        state.set_not_ready();
        state.set_ready();
        assert_eq!(state.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_probes_follow_phase() {
        let state = Arc::new(HealthState::new());
        let app = health_router(Arc::clone(&state));

        let (status, body) = probe(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "starting");

        let (status, body) = probe(&app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_ready");

        state.set_ready();
        let (status, body) = probe(&app, "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "serving");

        state.set_not_ready();
        let (status, body) = probe(&app, "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["phase"], "draining");
        let (status, _) = probe(&app, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
