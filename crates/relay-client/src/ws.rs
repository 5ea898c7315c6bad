//! WebSocket signaling channel.

use crate::channel::{ChannelConnector, SignalingChannel};
use crate::errors::ClientError;

use async_trait::async_trait;
use common::protocol::{ServerFrame, SignalEnvelope};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket channels to `ws://host/signal`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError> {
        let (socket, _) = connect_async(self.url.as_str()).await?;
        debug!(target: "relay.client", url = %self.url, "WebSocket connected");
        Ok(Box::new(WsChannel {
            socket,
            close_code: None,
            closed: false,
        }))
    }
}

pub struct WsChannel {
    socket: Socket,
    close_code: Option<u16>,
    closed: bool,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Transport("connection closed".to_string()));
        }
        let text = envelope.to_json()?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ServerFrame>, ClientError> {
        if self.closed {
            return Ok(None);
        }
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => match ServerFrame::from_json(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(e) => {
                        warn!(target: "relay.client", error = %e, "Undecodable frame from relay");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    self.close_code = frame.map(|f| u16::from(f.code));
                    self.closed = true;
                    return Ok(None);
                }
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(e.into());
                }
                None => {
                    self.closed = true;
                    return Ok(None);
                }
            }
        }
    }

    fn close_code(&mut self) -> Option<u16> {
        self.close_code
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.socket.close(None).await;
        }
    }
}
