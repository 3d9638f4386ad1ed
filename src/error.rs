//! Error types for the session coordinator
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Retry/fatal classification
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::MessageType;

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionClosed = 303,
    InvalidUrl = 305,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,
    ProtocolUnexpected = 402,

    // Request errors (5xx)
    RequestTimeout = 500,
    RequestRejected = 501,
    RequestInFlight = 502,
    RequestCancelled = 503,
    QueueOverflow = 510,

    // Internal errors (9xx)
    InternalError = 900,
    SessionClosed = 901,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10,
            200..=299 => 20,
            300..=399 => 30,
            400..=499 => 40,
            500..=599 => 50,
            900..=999 => 90,
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the session coordinator
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection attempt failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection attempt timed out
    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// The transport is closed and cannot carry frames
    #[error("Transport closed: {message}")]
    ConnectionClosed { message: String },

    /// Endpoint URL could not be parsed
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Malformed frame or payload
    #[error("Malformed protocol message: {message}")]
    ProtocolMalformed { message: String },

    /// Envelope `type` outside the known set
    #[error("Unknown message type '{message_type}'")]
    UnknownMessageType { message_type: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────

    /// The awaited response did not arrive before the deadline
    #[error("Request timed out after {timeout_ms}ms waiting for '{response_type}'")]
    RequestTimeout {
        response_type: MessageType,
        timeout_ms: u64,
    },

    /// The server answered a request with an error envelope
    #[error("Server rejected request with '{message_type}': {data}")]
    ServerRejected {
        message_type: MessageType,
        data: serde_json::Value,
    },

    /// Type-only correlation cannot run two requests for the same response type
    #[error("A request awaiting '{response_type}' is already in flight; attach a correlation id")]
    RequestInFlight { response_type: MessageType },

    /// Pending request failed because the session was disconnected on demand
    #[error("Session disconnected before the response arrived")]
    Disconnected,

    /// The outbound queue hit its cap; the oldest envelope was discarded
    #[error("Outbound queue full ({capacity} envelopes); dropped oldest '{dropped}'")]
    QueueOverflow { capacity: usize, dropped: MessageType },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// The session loop has exited; the handle can no longer be used
    #[error("Session loop is no longer running")]
    SessionClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,

            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::WebSocket(_) => ErrorCode::ConnectionFailed,
            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::ConnectionClosed { .. } => ErrorCode::ConnectionClosed,
            Error::InvalidUrl(_) => ErrorCode::InvalidUrl,

            Error::ProtocolMalformed { .. } => ErrorCode::ProtocolMalformed,
            Error::UnknownMessageType { .. } => ErrorCode::ProtocolUnexpected,
            Error::Serialization(_) => ErrorCode::ProtocolMalformed,

            Error::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Error::ServerRejected { .. } => ErrorCode::RequestRejected,
            Error::RequestInFlight { .. } => ErrorCode::RequestInFlight,
            Error::Disconnected => ErrorCode::RequestCancelled,
            Error::QueueOverflow { .. } => ErrorCode::QueueOverflow,

            Error::SessionClosed => ErrorCode::SessionClosed,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::WebSocket(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::ConnectionClosed { .. }
                | Error::RequestTimeout { .. }
                | Error::RequestInFlight { .. }
                | Error::Io(_)
        )
    }

    /// Check if the error is fatal (the CLI should exit)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigNotFound { .. }
                | Error::ConfigParse { .. }
                | Error::ConfigValidation { .. }
                | Error::InvalidUrl(_)
                | Error::SessionClosed
                | Error::Internal(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'groupchat-session config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'groupchat-session config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::ConnectionFailed { .. } | Error::WebSocket(_) => Some(
                "Check your network connection and verify the server URL is correct."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The server may be down or unreachable. Raise 'server.connect_timeout_ms' on slow links."
            ),
            Error::InvalidUrl(_) => Some(
                "The server URL must look like ws://host:port/path or wss://host/path."
            ),
            Error::RequestTimeout { .. } => Some(
                "The server did not answer in time. Raise 'requests.default_timeout_ms' or retry."
            ),
            Error::RequestInFlight { .. } => Some(
                "Wait for the previous request to finish, or give each request a correlation id."
            ),
            Error::QueueOverflow { .. } => Some(
                "Messages were sent faster than the connection recovered. Raise 'queue.max_pending' or set it to 0."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!("\x1b[31mError [{}]\x1b[0m: {}\n", self.code().as_str(), self);

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config validation error
    pub fn config_validation(message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a transport closed error
    pub fn connection_closed(message: impl Into<String>) -> Self {
        Error::ConnectionClosed {
            message: message.into(),
        }
    }

    /// Create a malformed protocol message error
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::ProtocolMalformed {
            message: message.into(),
        }
    }
}
