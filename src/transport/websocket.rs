//! WebSocket transport over tokio-tungstenite

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use url::Url;

use super::{CloseCode, Connector, Transport};
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────

/// Opens WebSocket connections with a bounded handshake
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&self, url: &Url) -> Result<WebSocketTransport> {
        debug!(url = %url, timeout_ms = self.connect_timeout.as_millis() as u64, "Opening WebSocket");

        let handshake = connect_async(url.as_str());
        let (stream, response) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| Error::ConnectionTimeout {
                url: url.to_string(),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| Error::connection_failed(url.as_str(), e.to_string()))?;

        info!(url = %url, status = %response.status(), "WebSocket connection established");
        Ok(WebSocketTransport { stream })
    }
}

// ─────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────

/// An open WebSocket connection
pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(data)) => {
                    return Some(String::from_utf8(data).map_err(|e| {
                        Error::malformed(format!("binary frame is not UTF-8: {}", e))
                    }));
                }
                // tungstenite queues the pong itself
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {
                    trace!("Keepalive frame");
                }
                Ok(WsMessage::Close(frame)) => {
                    info!(frame = ?frame, "Received close frame");
                    return None;
                }
                Ok(WsMessage::Frame(_)) => {}
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self, code: CloseCode) -> Result<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code.as_u16()),
            reason: "".into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
