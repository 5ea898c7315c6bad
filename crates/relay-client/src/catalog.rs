//! Stream registry access.
//!
//! [`StreamCatalog`] is what the control API needs from the registry.
//! [`LocalCatalog`] calls the lifecycle manager in-process and
//! [`HttpCatalog`] talks to the REST surface.

use crate::errors::ClientError;

use async_trait::async_trait;
use common::types::{Stream, StreamUpdate};
use relay_service::errors::RelayError;
use relay_service::handlers::streams::{
    MessageResponse, StreamListResponse, StreamResponse, CALLER_ID_HEADER,
};
use relay_service::lifecycle::StreamLifecycleManager;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Default timeout for registry HTTP calls.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait StreamCatalog: Send + Sync {
    async fn create_stream(&self, title: &str, broadcaster_id: &str)
        -> Result<Stream, ClientError>;

    async fn get_stream(&self, stream_id: &str) -> Result<Stream, ClientError>;

    /// Look a stream up by its shareable URL token.
    async fn resolve_url(&self, stream_url: &str) -> Result<Stream, ClientError>;

    /// Active streams, newest first.
    async fn list_active(&self) -> Result<Vec<Stream>, ClientError>;

    async fn update_stream(
        &self,
        stream_id: &str,
        update: StreamUpdate,
    ) -> Result<Stream, ClientError>;

    async fn end_stream(&self, stream_id: &str) -> Result<(), ClientError>;
}

impl From<RelayError> for ClientError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound(id) => ClientError::NotFound(id),
            other => ClientError::Registry {
                status: other.status_code().as_u16(),
                message: other.client_message(),
            },
        }
    }
}

/// Registry in the same process.
#[derive(Clone)]
pub struct LocalCatalog {
    lifecycle: StreamLifecycleManager,
}

impl LocalCatalog {
    #[must_use]
    pub fn new(lifecycle: StreamLifecycleManager) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl StreamCatalog for LocalCatalog {
    async fn create_stream(
        &self,
        title: &str,
        broadcaster_id: &str,
    ) -> Result<Stream, ClientError> {
        Ok(self.lifecycle.create_stream(title, broadcaster_id).await?)
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Stream, ClientError> {
        Ok(self.lifecycle.get_stream(stream_id).await?)
    }

    async fn resolve_url(&self, stream_url: &str) -> Result<Stream, ClientError> {
        Ok(self.lifecycle.resolve_url(stream_url).await?)
    }

    async fn list_active(&self) -> Result<Vec<Stream>, ClientError> {
        Ok(self.lifecycle.list_active_streams().await)
    }

    async fn update_stream(
        &self,
        stream_id: &str,
        update: StreamUpdate,
    ) -> Result<Stream, ClientError> {
        Ok(self.lifecycle.update_stream(stream_id, update).await?)
    }

    async fn end_stream(&self, stream_id: &str) -> Result<(), ClientError> {
        self.lifecycle.end_stream(stream_id).await?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CreateStreamBody<'a> {
    title: &'a str,
    broadcaster_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Registry over HTTP.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    caller_id: Option<String>,
}

impl HttpCatalog {
    /// # Errors
    ///
    /// `Transport` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REGISTRY_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            caller_id: None,
        })
    }

    /// Send `x-caller-id` with every request.
    #[must_use]
    pub fn with_caller_id(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.caller_id {
            Some(caller_id) => builder.header(CALLER_ID_HEADER, caller_id),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        subject: &str,
    ) -> Result<T, ClientError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.canonical_reason().unwrap_or("unknown").to_string(),
        };
        debug!(target: "relay.client", status = status.as_u16(), %message, "Registry request failed");
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(subject.to_string()));
        }
        Err(ClientError::Registry {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl StreamCatalog for HttpCatalog {
    #[instrument(skip_all, name = "relay.client.create_stream")]
    async fn create_stream(
        &self,
        title: &str,
        broadcaster_id: &str,
    ) -> Result<Stream, ClientError> {
        let builder = self
            .request(reqwest::Method::POST, "/streams")
            .json(&CreateStreamBody {
                title,
                broadcaster_id,
            });
        let response: StreamResponse = self.send(builder, title).await?;
        Ok(response.stream)
    }

    async fn get_stream(&self, stream_id: &str) -> Result<Stream, ClientError> {
        let builder = self.request(reqwest::Method::GET, &format!("/streams/{stream_id}"));
        let response: StreamResponse = self.send(builder, stream_id).await?;
        Ok(response.stream)
    }

    async fn resolve_url(&self, stream_url: &str) -> Result<Stream, ClientError> {
        let builder = self.request(
            reqwest::Method::GET,
            &format!("/streams/by-url/{stream_url}"),
        );
        let response: StreamResponse = self.send(builder, stream_url).await?;
        Ok(response.stream)
    }

    async fn list_active(&self) -> Result<Vec<Stream>, ClientError> {
        let builder = self.request(reqwest::Method::GET, "/streams");
        let response: StreamListResponse = self.send(builder, "streams").await?;
        Ok(response.streams)
    }

    async fn update_stream(
        &self,
        stream_id: &str,
        update: StreamUpdate,
    ) -> Result<Stream, ClientError> {
        let builder = self
            .request(reqwest::Method::PUT, &format!("/streams/{stream_id}"))
            .json(&update);
        let response: StreamResponse = self.send(builder, stream_id).await?;
        Ok(response.stream)
    }

    #[instrument(skip_all, name = "relay.client.end_stream", fields(stream_id = %stream_id))]
    async fn end_stream(&self, stream_id: &str) -> Result<(), ClientError> {
        let builder = self.request(reqwest::Method::DELETE, &format!("/streams/{stream_id}"));
        let _: MessageResponse = self.send(builder, stream_id).await?;
        Ok(())
    }
}
