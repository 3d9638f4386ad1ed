//! Configuration system for the session coordinator
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (GROUPCHAT_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

/// Main session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Who this session speaks for
    pub identity: IdentitySettings,

    /// Server endpoint settings
    pub server: ServerSettings,

    /// Reconnection backoff
    pub reconnect: ReconnectSettings,

    /// Request/response correlation
    pub requests: RequestSettings,

    /// Typing indicator and presence tracking
    pub presence: PresenceSettings,

    /// Outbound queue policy
    pub queue: QueueSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Identity announced to the server on every connect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    /// Server-side user id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Display name (defaults to the host name)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Server endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// WebSocket endpoint URL
    pub url: String,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Reconnection backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    /// First retry delay in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds
    pub cap_delay_ms: u64,

    /// Maximum reconnection attempts (0 = infinite)
    pub max_attempts: u32,
}

/// Request/response correlation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestSettings {
    /// Default time to wait for a correlated response in milliseconds
    pub default_timeout_ms: u64,

    /// Attach a correlation id to every request (the server must echo it back)
    pub attach_correlation_id: bool,
}

/// Presence tracking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceSettings {
    /// How long a typing indicator stays valid without a refresh, in milliseconds
    pub typing_ttl_ms: u64,
}

/// Outbound queue settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Maximum envelopes held while offline (0 = unbounded, otherwise drop-oldest)
    pub max_pending: usize,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/ws".to_string(),
            connect_timeout_ms: 10000,
        }
    }
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            cap_delay_ms: 30000,
            max_attempts: 0, // Infinite
        }
    }
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 8000,
            attach_correlation_id: true,
        }
    }
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self { typing_ttl_ms: 8000 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_files: 5,
            json_format: false,
        }
    }
}

impl SessionConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path)?;
            config = toml::from_str(&content).map_err(|e| Error::ConfigParse {
                message: format!("{}: {}", path.display(), e.message()),
                source: Some(e),
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("groupchat-session.toml"),
            dirs::config_dir()
                .map(|p| p.join("groupchat").join("session.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".groupchat").join("session.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GROUPCHAT_USER_ID") {
            self.identity.user_id = Some(val);
        }
        if let Ok(val) = std::env::var("GROUPCHAT_DISPLAY_NAME") {
            self.identity.display_name = Some(val);
        }

        if let Ok(val) = std::env::var("GROUPCHAT_SERVER_URL") {
            self.server.url = val;
        }
        if let Some(n) = env_parse("GROUPCHAT_CONNECT_TIMEOUT_MS") {
            self.server.connect_timeout_ms = n;
        }

        if let Some(n) = env_parse("GROUPCHAT_RECONNECT_BASE_MS") {
            self.reconnect.base_delay_ms = n;
        }
        if let Some(n) = env_parse("GROUPCHAT_RECONNECT_CAP_MS") {
            self.reconnect.cap_delay_ms = n;
        }
        if let Some(n) = env_parse("GROUPCHAT_MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = n;
        }

        if let Some(n) = env_parse("GROUPCHAT_REQUEST_TIMEOUT_MS") {
            self.requests.default_timeout_ms = n;
        }
        if let Ok(val) = std::env::var("GROUPCHAT_CORRELATION_IDS") {
            self.requests.attach_correlation_id = val.to_lowercase() == "true" || val == "1";
        }
        if let Some(n) = env_parse("GROUPCHAT_TYPING_TTL_MS") {
            self.presence.typing_ttl_ms = n;
        }
        if let Some(n) = env_parse("GROUPCHAT_QUEUE_MAX_PENDING") {
            self.queue.max_pending = n;
        }

        if let Ok(val) = std::env::var("GROUPCHAT_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("GROUPCHAT_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("GROUPCHAT_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.server.url).map_err(|e| {
            Error::config_field_invalid("server.url", format!("'{}': {}", self.server.url, e))
        })?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(Error::config_field_invalid(
                "server.url",
                "Server URL must start with ws:// or wss://",
            ));
        }

        if self.server.connect_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "server.connect_timeout_ms",
                "connect_timeout_ms must be greater than 0",
            ));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::config_field_invalid(
                "reconnect.base_delay_ms",
                "base_delay_ms must be greater than 0",
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.cap_delay_ms {
            return Err(Error::config_field_invalid(
                "reconnect.cap_delay_ms",
                format!(
                    "cap_delay_ms ({}) must not be lower than base_delay_ms ({})",
                    self.reconnect.cap_delay_ms, self.reconnect.base_delay_ms
                ),
            ));
        }

        if self.requests.default_timeout_ms == 0 {
            return Err(Error::config_field_invalid(
                "requests.default_timeout_ms",
                "default_timeout_ms must be greater than 0",
            ));
        }
        if self.presence.typing_ttl_ms == 0 {
            return Err(Error::config_field_invalid(
                "presence.typing_ttl_ms",
                "typing_ttl_ms must be greater than 0",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Parsed server endpoint
    pub fn server_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.server.url)?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.server.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.requests.default_timeout_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.presence.typing_ttl_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.base_delay_ms)
    }

    pub fn cap_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.cap_delay_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".groupchat")
                .join("session.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Groupchat session configuration

[identity]
# Server-side user id (required for `run` unless passed with --user-id)
# user_id = "u-123"

# Display name announced with join_community (defaults to the host name)
# display_name = "Alice"

[server]
# WebSocket endpoint
url = "ws://localhost:3001/ws"

# Connection timeout in milliseconds
connect_timeout_ms = 10000

[reconnect]
# Retry delay is min(base_delay_ms * 2^attempt, cap_delay_ms)
base_delay_ms = 1000
cap_delay_ms = 30000

# Maximum reconnection attempts (0 = infinite)
max_attempts = 0

[requests]
# How long to wait for a correlated response in milliseconds
default_timeout_ms = 8000

# Tag requests with a correlation id so concurrent requests of the same kind
# can be told apart. Disable only if the server does not echo `correlationId`.
attach_correlation_id = true

[presence]
# Typing indicators expire after this many milliseconds without a refresh
typing_ttl_ms = 8000

[queue]
# Envelopes held while offline (0 = unbounded; otherwise the oldest is dropped)
max_pending = 0

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.groupchat/logs/session.log"

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
