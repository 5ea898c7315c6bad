//! Stream registry handlers.
//!
//! - `POST /streams` - Start a stream
//! - `GET /streams` - Active streams, newest first
//! - `GET /streams/{id}` - One stream
//! - `GET /streams/by-url/{stream_url}` - Resolve a shared link
//! - `PUT /streams/{id}` - Rename or end a stream
//! - `DELETE /streams/{id}` - End a stream
//!
//! Caller identity is opaque: `broadcaster_id` in the body wins, then the
//! `x-caller-id` header, then [`ANONYMOUS_CALLER`].

use crate::errors::RelayError;
use crate::routes::AppState;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use common::types::{Stream, StreamUpdate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};

/// Header carrying the caller's opaque identity.
pub const CALLER_ID_HEADER: &str = "x-caller-id";

/// Identity used when the caller supplies none.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Request body for POST /streams.
#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    /// Missing titles are treated as empty and rejected as invalid.
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub broadcaster_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub stream: Stream,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamListResponse {
    pub streams: Vec<Stream>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

fn caller_id(body_id: Option<String>, headers: &HeaderMap) -> String {
    body_id
        .filter(|id| !id.trim().is_empty())
        .or_else(|| {
            headers
                .get(CALLER_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| ANONYMOUS_CALLER.to_string())
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, RelayError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| RelayError::Validation(rejection.body_text()))
}

/// Handler for POST /streams
#[instrument(skip_all, name = "relay.handlers.create_stream")]
pub async fn create_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<CreateStreamRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StreamResponse>), RelayError> {
    let request = json_body(body)?;
    let broadcaster_id = caller_id(request.broadcaster_id, &headers);

    let stream = state
        .lifecycle
        .create_stream(&request.title, &broadcaster_id)
        .await?;

    info!(
        target: "relay.handlers",
        stream_id = %stream.id,
        "Stream created"
    );
    Ok((StatusCode::CREATED, Json(StreamResponse { stream })))
}

/// Handler for GET /streams
#[instrument(skip_all, name = "relay.handlers.list_streams")]
pub async fn list_streams(State(state): State<Arc<AppState>>) -> Json<StreamListResponse> {
    Json(StreamListResponse {
        streams: state.lifecycle.list_active_streams().await,
    })
}

/// Handler for GET /streams/{id}
#[instrument(skip_all, name = "relay.handlers.get_stream", fields(stream_id = %id))]
pub async fn get_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StreamResponse>, RelayError> {
    let stream = state.lifecycle.get_stream(&id).await?;
    Ok(Json(StreamResponse { stream }))
}

/// Handler for GET /streams/by-url/{stream_url}
#[instrument(skip_all, name = "relay.handlers.get_stream_by_url")]
pub async fn get_stream_by_url(
    State(state): State<Arc<AppState>>,
    Path(stream_url): Path<String>,
) -> Result<Json<StreamResponse>, RelayError> {
    let stream = state.lifecycle.resolve_url(&stream_url).await?;
    Ok(Json(StreamResponse { stream }))
}

/// Handler for PUT /streams/{id}
///
/// Accepts `title` and `is_active`. Any other field, including
/// `listener_count`, is rejected with 400.
#[instrument(skip_all, name = "relay.handlers.update_stream", fields(stream_id = %id))]
pub async fn update_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<StreamUpdate>, JsonRejection>,
) -> Result<Json<StreamResponse>, RelayError> {
    let update = json_body(body)?;
    let stream = state.lifecycle.update_stream(&id, update).await?;
    Ok(Json(StreamResponse { stream }))
}

/// Handler for DELETE /streams/{id}
#[instrument(skip_all, name = "relay.handlers.end_stream", fields(stream_id = %id))]
pub async fn end_stream(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, RelayError> {
    state.lifecycle.end_stream(&id).await?;
    Ok(Json(MessageResponse {
        message: "Stream ended successfully".to_string(),
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_id_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(caller_id(None, &headers), ANONYMOUS_CALLER);

        headers.insert(CALLER_ID_HEADER, HeaderValue::from_static("header-user"));
        assert_eq!(caller_id(None, &headers), "header-user");
        assert_eq!(
            caller_id(Some("body-user".to_string()), &headers),
            "body-user"
        );
        assert_eq!(caller_id(Some("  ".to_string()), &headers), "header-user");
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateStreamRequest = serde_json::from_str("{}").unwrap();
        assert!(request.title.is_empty());
        assert!(request.broadcaster_id.is_none());
    }
}
