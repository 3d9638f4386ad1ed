//! Connection state, identity and the reconnect backoff schedule

use std::fmt;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::Serialize;

use crate::config::{IdentitySettings, SessionConfig};
use crate::error::{Error, Result};
use crate::protocol::PresenceStatus;

use super::presence::PresenceTracker;
use super::queue::OutboundQueue;

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Lifecycle of the single logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Initial state, and the state after an explicit disconnect
    #[default]
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open; the queue drains straight through
    Connected,
    /// Waiting for the backoff timer before the next attempt
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────

/// Who the session speaks for; announced with `join_community` on every open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Build from config; the display name falls back to the host name
    pub fn from_settings(settings: &IdentitySettings) -> Result<Self> {
        let user_id = settings
            .user_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                Error::config_field_invalid(
                    "identity.user_id",
                    "A user id is required (set identity.user_id, GROUPCHAT_USER_ID or --user-id)",
                )
            })?;

        let display_name = settings
            .display_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(default_display_name);

        Ok(Self { user_id, display_name })
    }
}

fn default_display_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "groupchat-user".to_string())
}

// ─────────────────────────────────────────────────────────────────
// Session Settings
// ─────────────────────────────────────────────────────────────────

/// Runtime knobs the session loop reads, resolved from [`SessionConfig`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub base_delay: Duration,
    pub cap_delay: Duration,
    /// 0 = retry forever
    pub max_reconnect_attempts: u32,
    pub request_timeout: Duration,
    pub typing_ttl: Duration,
    /// 0 = unbounded
    pub max_pending: usize,
    /// Attach correlation ids to requests made by the domain operations
    pub attach_correlation_id: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            base_delay: config.base_delay(),
            cap_delay: config.cap_delay(),
            max_reconnect_attempts: config.reconnect.max_attempts,
            request_timeout: config.request_timeout(),
            typing_ttl: config.typing_ttl(),
            max_pending: config.queue.max_pending,
            attach_correlation_id: config.requests.attach_correlation_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Reconnect Backoff
// ─────────────────────────────────────────────────────────────────

/// Deterministic `min(base * 2^attempt, cap)` schedule
pub struct ReconnectBackoff {
    inner: ExponentialBackoff,
    cap: Duration,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let base = base.min(cap);
        let inner = ExponentialBackoff {
            current_interval: base,
            initial_interval: base,
            randomization_factor: 0.0,
            multiplier: 2.0,
            max_interval: cap,
            max_elapsed_time: None,
            ..Default::default()
        };
        Self { inner, cap }
    }

    /// Delay before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        self.inner.next_backoff().unwrap_or(self.cap).min(self.cap)
    }

    /// Back to `base`, after a successful open or an explicit disconnect
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

// ─────────────────────────────────────────────────────────────────
// Shared Session State
// ─────────────────────────────────────────────────────────────────

/// Everything guarded by the session mutex
pub(crate) struct SessionState {
    pub connection: ConnectionState,
    pub identity: Identity,
    pub reconnect_attempt: u32,
    /// Whether this session has ever reached `connected`
    pub has_connected: bool,
    pub queue: OutboundQueue,
    pub presence: PresenceTracker,
    /// Status re-announced on every open
    pub announced_status: Option<PresenceStatus>,
}

impl SessionState {
    pub fn new(identity: Identity, settings: &SessionSettings) -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            identity,
            reconnect_attempt: 0,
            has_connected: false,
            queue: OutboundQueue::new(settings.max_pending),
            presence: PresenceTracker::new(settings.typing_ttl),
            announced_status: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}
