//! Duplex channel the session runs over
//!
//! The session never touches sockets directly. A [`Connector`] opens one
//! [`Transport`] per connection attempt; the transport moves text frames and
//! reports closure. [`websocket`] is the production implementation, tests
//! script their own.

use async_trait::async_trait;
use url::Url;

use crate::error::Result;

pub mod websocket;

pub use websocket::{WebSocketConnector, WebSocketTransport};

/// Reason attached to a locally initiated close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Intentional shutdown (1000); the only close that does not trigger reconnection
    Normal,
    /// Process is going away (1001)
    GoingAway,
}

impl CloseCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
        }
    }
}

/// One open connection
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a single text frame
    async fn send(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame
    ///
    /// `None` means the peer closed the connection. Must be cancel-safe: the
    /// session polls it inside `tokio::select!` and drops it whenever another
    /// branch wins.
    async fn recv(&mut self) -> Option<Result<String>>;

    /// Close the connection with the given code
    async fn close(&mut self, code: CloseCode) -> Result<()>;
}

/// Opens transports; one call per connection attempt
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open a connection. `Ok` is the "open" event, `Err` a failed attempt.
    async fn connect(&self, url: &Url) -> Result<Self::Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_codes() {
        assert_eq!(CloseCode::Normal.as_u16(), 1000);
        assert_eq!(CloseCode::GoingAway.as_u16(), 1001);
    }
}
