//! Groupchat session - real-time session coordinator for group messaging
//!
//! Maintains one persistent, self-healing WebSocket connection to a
//! group-messaging server and gives the application:
//! - reconnection with exponential backoff and state restoration
//! - an ordered outbound queue that holds messages while offline
//! - typed subscriptions to inbound events
//! - request/response correlation with timeouts
//! - group membership, typing and presence tracking
//!
//! ```no_run
//! use groupchat_session::{Identity, Session, SessionConfig, WebSocketConnector};
//!
//! # async fn demo() -> groupchat_session::Result<()> {
//! let config = SessionConfig::default();
//! let connector = WebSocketConnector::new(config.connect_timeout());
//! let (session, _events) = Session::start(&config, Identity::new("u-1", "Ada"), connector)?;
//!
//! session.join_group("general")?;
//! session.send_group_message("general", "hello")?;
//! session.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod version;

pub use config::SessionConfig;
pub use error::{Error, ErrorCode, Result};
pub use protocol::{Envelope, MessageType, PresenceStatus};
pub use session::{ConnectionState, Identity, Session, SessionEvent, SessionSettings, SubscriptionId};
pub use transport::{CloseCode, Connector, Transport, WebSocketConnector, WebSocketTransport};
