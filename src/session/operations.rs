//! Group-messaging operations on top of the session
//!
//! Fire-and-forget operations queue a single envelope. Request operations
//! wait for their paired response and reject on the paired error type.

use std::time::Duration;

use serde_json::Value;

use super::client::Session;
use super::correlation::new_correlation_id;
use crate::error::Result;
use crate::protocol::{
    DeleteMessage, Envelope, GetUserStatus, GroupRef, JoinCommunity, LoadGroupMessages,
    MessageType, PresenceStatus, SendGroupMessage, UpdateStatus, UserStatusEvent,
};
use crate::version::build_info;

impl Session {
    fn tagged(&self, envelope: Envelope) -> Envelope {
        if self.settings().attach_correlation_id {
            envelope.with_correlation_id(new_correlation_id())
        } else {
            envelope
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────

    /// Re-announce the identity; happens automatically on every open
    pub fn join_community(&self) -> Result<()> {
        self.declare(|state| {
            let envelope = Envelope::new(
                MessageType::JoinCommunity,
                &JoinCommunity {
                    user_id: state.identity.user_id.clone(),
                    username: state.identity.display_name.clone(),
                    client: Some(build_info().client_tag()),
                },
            )?;
            Ok(Some(envelope))
        })
    }

    /// Join a group; membership is recorded immediately
    ///
    /// The server's acknowledgment is not awaited. A failure arrives later as
    /// an `error` event.
    pub fn join_group(&self, group_id: &str) -> Result<()> {
        self.declare(|state| {
            if !state.presence.join(group_id) {
                return Ok(None);
            }
            Ok(Some(Envelope::new(
                MessageType::JoinGroup,
                &GroupRef {
                    group_id: group_id.to_string(),
                },
            )?))
        })
    }

    /// Leave a group and drop its member/typing state right away
    pub fn leave_group(&self, group_id: &str) -> Result<()> {
        self.declare(|state| {
            state.presence.leave(group_id);
            Ok(Some(Envelope::new(
                MessageType::LeaveGroup,
                &GroupRef {
                    group_id: group_id.to_string(),
                },
            )?))
        })
    }

    // ─────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────

    pub fn send_group_message(&self, group_id: &str, content: &str) -> Result<()> {
        self.send(Envelope::new(
            MessageType::SendGroupMessage,
            &SendGroupMessage {
                group_id: group_id.to_string(),
                content: content.to_string(),
            },
        )?)
    }

    /// Fetch message history; resolves with the `group_messages_loaded` data
    pub async fn load_group_messages(&self, query: LoadGroupMessages) -> Result<Value> {
        let timeout = self.settings().request_timeout;
        self.load_group_messages_with_timeout(query, timeout).await
    }

    pub async fn load_group_messages_with_timeout(
        &self,
        query: LoadGroupMessages,
        timeout: Duration,
    ) -> Result<Value> {
        let request = self.tagged(Envelope::new(MessageType::LoadGroupMessages, &query)?);
        let response = self
            .request_with_errors(
                request,
                MessageType::GroupMessagesLoaded,
                &[MessageType::LoadMessagesError],
                timeout,
            )
            .await?;
        Ok(response.into_data())
    }

    /// Delete a message; resolves with the `message_deleted_success` data
    pub async fn delete_message(&self, message_id: &str, group_id: Option<&str>) -> Result<Value> {
        let request = self.tagged(Envelope::new(
            MessageType::DeleteMessage,
            &DeleteMessage {
                message_id: message_id.to_string(),
                group_id: group_id.map(str::to_string),
            },
        )?);
        let response = self
            .request_with_errors(
                request,
                MessageType::MessageDeletedSuccess,
                &[MessageType::DeleteMessageError],
                self.settings().request_timeout,
            )
            .await?;
        Ok(response.into_data())
    }

    // ─────────────────────────────────────────────────────────────
    // Typing & Presence
    // ─────────────────────────────────────────────────────────────

    pub fn start_typing(&self, group_id: &str) -> Result<()> {
        self.send(Envelope::new(
            MessageType::TypingStart,
            &GroupRef {
                group_id: group_id.to_string(),
            },
        )?)
    }

    pub fn stop_typing(&self, group_id: &str) -> Result<()> {
        self.send(Envelope::new(
            MessageType::TypingStop,
            &GroupRef {
                group_id: group_id.to_string(),
            },
        )?)
    }

    /// Announce our own status; re-announced on every reconnect
    pub fn update_status(&self, status: PresenceStatus) -> Result<()> {
        self.declare(|state| {
            state.announced_status = Some(status);
            let own = state.identity.user_id.clone();
            state.presence.set_presence(&own, status);
            Ok(Some(Envelope::new(MessageType::UpdateStatus, &UpdateStatus { status })?))
        })
    }

    /// Ask the server for a user's status; the presence tracker is updated too
    pub async fn get_user_status(&self, user_id: &str) -> Result<UserStatusEvent> {
        let request = self.tagged(Envelope::new(
            MessageType::GetUserStatus,
            &GetUserStatus {
                user_id: user_id.to_string(),
            },
        )?);
        let response = self
            .request(request, MessageType::UserStatusInfo, self.settings().request_timeout)
            .await?;
        response.payload()
    }
}
