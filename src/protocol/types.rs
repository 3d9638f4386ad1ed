//! Message type tags and the typed payloads the session reads
//!
//! Payload structs only name the fields the coordinator itself inspects;
//! everything else in `data` passes through untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ─────────────────────────────────────────────────────────────────
// Message Types
// ─────────────────────────────────────────────────────────────────

/// Closed set of envelope `type` tags understood by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // ─── Client → Server ────────────────────────────────────────
    JoinCommunity,
    JoinGroup,
    LeaveGroup,
    SendGroupMessage,
    LoadGroupMessages,
    DeleteMessage,
    TypingStart,
    TypingStop,
    UpdateStatus,
    GetUserStatus,

    // ─── Server → Client ────────────────────────────────────────
    GroupMessage,
    UserJoined,
    UserLeft,
    Typing,
    StopTyping,
    MessageDeleted,
    UserStatusUpdate,
    GroupMessagesLoaded,
    LoadMessagesError,
    MessageDeletedSuccess,
    DeleteMessageError,
    UserStatusInfo,
    Error,
}

impl MessageType {
    /// Every tag, outbound first
    pub const ALL: [MessageType; 23] = [
        MessageType::JoinCommunity,
        MessageType::JoinGroup,
        MessageType::LeaveGroup,
        MessageType::SendGroupMessage,
        MessageType::LoadGroupMessages,
        MessageType::DeleteMessage,
        MessageType::TypingStart,
        MessageType::TypingStop,
        MessageType::UpdateStatus,
        MessageType::GetUserStatus,
        MessageType::GroupMessage,
        MessageType::UserJoined,
        MessageType::UserLeft,
        MessageType::Typing,
        MessageType::StopTyping,
        MessageType::MessageDeleted,
        MessageType::UserStatusUpdate,
        MessageType::GroupMessagesLoaded,
        MessageType::LoadMessagesError,
        MessageType::MessageDeletedSuccess,
        MessageType::DeleteMessageError,
        MessageType::UserStatusInfo,
        MessageType::Error,
    ];

    /// Wire name of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::JoinCommunity => "join_community",
            MessageType::JoinGroup => "join_group",
            MessageType::LeaveGroup => "leave_group",
            MessageType::SendGroupMessage => "send_group_message",
            MessageType::LoadGroupMessages => "load_group_messages",
            MessageType::DeleteMessage => "delete_message",
            MessageType::TypingStart => "typing_start",
            MessageType::TypingStop => "typing_stop",
            MessageType::UpdateStatus => "update_status",
            MessageType::GetUserStatus => "get_user_status",
            MessageType::GroupMessage => "group_message",
            MessageType::UserJoined => "user_joined",
            MessageType::UserLeft => "user_left",
            MessageType::Typing => "typing",
            MessageType::StopTyping => "stop_typing",
            MessageType::MessageDeleted => "message_deleted",
            MessageType::UserStatusUpdate => "user_status_update",
            MessageType::GroupMessagesLoaded => "group_messages_loaded",
            MessageType::LoadMessagesError => "load_messages_error",
            MessageType::MessageDeletedSuccess => "message_deleted_success",
            MessageType::DeleteMessageError => "delete_message_error",
            MessageType::UserStatusInfo => "user_status_info",
            MessageType::Error => "error",
        }
    }

    /// Check if the session sends this type (client → server)
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            MessageType::JoinCommunity
                | MessageType::JoinGroup
                | MessageType::LeaveGroup
                | MessageType::SendGroupMessage
                | MessageType::LoadGroupMessages
                | MessageType::DeleteMessage
                | MessageType::TypingStart
                | MessageType::TypingStop
                | MessageType::UpdateStatus
                | MessageType::GetUserStatus
        )
    }

    /// Check if the server sends this type (server → client)
    pub fn is_inbound(&self) -> bool {
        !self.is_outbound()
    }

    /// Check if the type reports a server-side failure
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            MessageType::Error | MessageType::LoadMessagesError | MessageType::DeleteMessageError
        )
    }

    /// Error type the server sends instead of this response type
    pub fn paired_error(&self) -> Option<MessageType> {
        match self {
            MessageType::GroupMessagesLoaded => Some(MessageType::LoadMessagesError),
            MessageType::MessageDeletedSuccess => Some(MessageType::DeleteMessageError),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownMessageType {
                message_type: s.to_string(),
            })
    }
}

// ─────────────────────────────────────────────────────────────────
// Presence
// ─────────────────────────────────────────────────────────────────

/// A user's session-global status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    #[serde(other)]
    Unknown,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
            PresenceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "online" => PresenceStatus::Online,
            "offline" => PresenceStatus::Offline,
            _ => PresenceStatus::Unknown,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Outbound Payloads
// ─────────────────────────────────────────────────────────────────

/// `join_community`: announces who this connection speaks for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinCommunity {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// Payload naming a single group (`join_group`, `leave_group`, typing notifications)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRef {
    pub group_id: String,
}

/// `send_group_message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupMessage {
    pub group_id: String,
    pub content: String,
}

/// `load_group_messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadGroupMessages {
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Load messages older than this message id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
}

/// `delete_message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

/// `update_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub status: PresenceStatus,
}

/// `get_user_status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUserStatus {
    pub user_id: String,
}

// ─────────────────────────────────────────────────────────────────
// Inbound Payloads
// ─────────────────────────────────────────────────────────────────

/// Fields shared by `group_message`, `user_joined`, `user_left`, `typing`, `stop_typing`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupUserEvent {
    pub group_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// `user_status_update` and `user_status_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusEvent {
    pub user_id: String,
    pub status: PresenceStatus,
}

/// `message_deleted` and `message_deleted_success`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedEvent {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_match_serde() {
        for t in MessageType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
    }

    #[test]
    fn test_direction_split() {
        let outbound = MessageType::ALL.iter().filter(|t| t.is_outbound()).count();
        assert_eq!(outbound, 10);
        assert!(MessageType::GroupMessagesLoaded.is_inbound());
        assert!(MessageType::DeleteMessage.is_outbound());
    }

    #[test]
    fn test_error_types() {
        assert!(MessageType::Error.is_error());
        assert!(MessageType::LoadMessagesError.is_error());
        assert!(MessageType::DeleteMessageError.is_error());
        assert!(!MessageType::MessageDeletedSuccess.is_error());
    }

    #[test]
    fn test_paired_error_types() {
        assert_eq!(
            MessageType::GroupMessagesLoaded.paired_error(),
            Some(MessageType::LoadMessagesError)
        );
        assert_eq!(
            MessageType::MessageDeletedSuccess.paired_error(),
            Some(MessageType::DeleteMessageError)
        );
        assert_eq!(MessageType::UserStatusInfo.paired_error(), None);
        for t in MessageType::ALL {
            if let Some(paired) = t.paired_error() {
                assert!(paired.is_error());
            }
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = "reaction_added".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType { .. }));
    }

    #[test]
    fn test_presence_status_lenient() {
        let online: PresenceStatus = serde_json::from_str("\"online\"").unwrap();
        let away: PresenceStatus = serde_json::from_str("\"away\"").unwrap();
        assert_eq!(online, PresenceStatus::Online);
        assert_eq!(away, PresenceStatus::Unknown);
        assert_eq!("OFFLINE".parse::<PresenceStatus>().unwrap(), PresenceStatus::Offline);
    }

    #[test]
    fn test_payloads_camel_case() {
        let json = serde_json::to_value(LoadGroupMessages {
            group_id: "g1".into(),
            limit: Some(50),
            before: None,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "groupId": "g1", "limit": 50 }));

        let event: GroupUserEvent =
            serde_json::from_value(serde_json::json!({ "groupId": "g1", "userId": "u2", "content": "hi" }))
                .unwrap();
        assert_eq!(event.user_id, "u2");
        assert_eq!(event.username, None);
    }
}
