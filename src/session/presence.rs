//! Group membership, typing indicators and presence
//!
//! Membership is the set of groups this session has joined. Per group the
//! tracker mirrors `members` and `typing` from server events. Typing entries
//! carry the instant they were last refreshed and stop counting once the TTL
//! passes, whether or not a `stop_typing` ever arrives. Presence is global
//! per user and is overwritten by every status event in receipt order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::protocol::{Envelope, GroupUserEvent, MessageType, PresenceStatus, UserStatusEvent};

/// Latest known status of one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub status: PresenceStatus,
    pub last_updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GroupState {
    members: HashSet<String>,
    typing: HashMap<String, Instant>,
}

pub struct PresenceTracker {
    typing_ttl: Duration,
    groups: BTreeMap<String, GroupState>,
    presence: HashMap<String, PresenceEntry>,
}

impl PresenceTracker {
    pub fn new(typing_ttl: Duration) -> Self {
        Self {
            typing_ttl,
            groups: BTreeMap::new(),
            presence: HashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────

    /// Start tracking a group; false if already joined
    pub fn join(&mut self, group_id: &str) -> bool {
        if self.groups.contains_key(group_id) {
            return false;
        }
        self.groups.insert(group_id.to_string(), GroupState::default());
        true
    }

    /// Stop tracking a group and drop its member/typing state
    pub fn leave(&mut self, group_id: &str) -> bool {
        self.groups.remove(group_id).is_some()
    }

    pub fn is_member(&self, group_id: &str) -> bool {
        self.groups.contains_key(group_id)
    }

    /// Joined groups, sorted
    pub fn groups(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Members of a joined group, sorted
    pub fn members(&self, group_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .groups
            .get(group_id)
            .map(|g| g.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    // ─────────────────────────────────────────────────────────────
    // Typing
    // ─────────────────────────────────────────────────────────────

    /// Users currently typing in a group, sorted; expired entries are excluded
    pub fn typing_users(&self, group_id: &str) -> Vec<String> {
        let now = Instant::now();
        let mut users: Vec<String> = self
            .groups
            .get(group_id)
            .map(|g| {
                g.typing
                    .iter()
                    .filter(|(_, since)| now.duration_since(**since) < self.typing_ttl)
                    .map(|(user, _)| user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Remove expired typing entries; returns how many were removed
    pub fn prune_expired(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.typing_ttl;
        let mut removed = 0;
        for group in self.groups.values_mut() {
            let before = group.typing.len();
            group.typing.retain(|_, since| now.duration_since(*since) < ttl);
            removed += before - group.typing.len();
        }
        if removed > 0 {
            trace!(removed, "Pruned expired typing indicators");
        }
        removed
    }

    /// Forget all typing state (connection lost)
    pub fn clear_typing(&mut self) {
        for group in self.groups.values_mut() {
            group.typing.clear();
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Presence
    // ─────────────────────────────────────────────────────────────

    pub fn presence(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.presence.get(user_id)
    }

    pub fn set_presence(&mut self, user_id: &str, status: PresenceStatus) {
        self.presence.insert(
            user_id.to_string(),
            PresenceEntry {
                status,
                last_updated_at: Utc::now(),
            },
        );
    }

    /// Forget everything (explicit disconnect)
    pub fn clear_all(&mut self) {
        self.groups.clear();
        self.presence.clear();
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound Events
    // ─────────────────────────────────────────────────────────────

    /// Fold one inbound envelope into the tracked state
    pub fn apply(&mut self, envelope: &Envelope) {
        match envelope.kind() {
            MessageType::UserStatusUpdate | MessageType::UserStatusInfo => {
                match envelope.payload::<UserStatusEvent>() {
                    Ok(event) => self.set_presence(&event.user_id, event.status),
                    Err(e) => debug!(error = %e, "Ignoring status event without userId/status"),
                }
            }
            MessageType::Typing
            | MessageType::StopTyping
            | MessageType::GroupMessage
            | MessageType::UserJoined
            | MessageType::UserLeft => {
                let event = match envelope.payload::<GroupUserEvent>() {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(error = %e, "Ignoring group event without groupId/userId");
                        return;
                    }
                };
                self.apply_group_event(envelope.kind(), event);
            }
            _ => {}
        }
    }

    fn apply_group_event(&mut self, kind: MessageType, event: GroupUserEvent) {
        let Some(group) = self.groups.get_mut(&event.group_id) else {
            trace!(group_id = %event.group_id, message_type = %kind, "Event for a group we have not joined");
            return;
        };

        match kind {
            MessageType::Typing => {
                group.typing.insert(event.user_id, Instant::now());
            }
            MessageType::StopTyping | MessageType::GroupMessage => {
                group.typing.remove(&event.user_id);
            }
            MessageType::UserJoined => {
                group.members.insert(event.user_id);
            }
            MessageType::UserLeft => {
                group.typing.remove(&event.user_id);
                group.members.remove(&event.user_id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: MessageType, group: &str, user: &str) -> Envelope {
        Envelope::with_data(kind, json!({ "groupId": group, "userId": user }))
    }

    fn tracker() -> PresenceTracker {
        let mut t = PresenceTracker::new(Duration::from_secs(8));
        t.join("g1");
        t
    }

    #[test]
    fn test_join_leave() {
        let mut t = PresenceTracker::new(Duration::from_secs(8));
        assert!(t.join("g2"));
        assert!(t.join("g1"));
        assert!(!t.join("g1"));
        assert_eq!(t.groups(), vec!["g1", "g2"]);

        assert!(t.leave("g1"));
        assert!(!t.leave("g1"));
        assert!(!t.is_member("g1"));
    }

    #[test]
    fn test_members_mirror_events() {
        let mut t = tracker();
        t.apply(&event(MessageType::UserJoined, "g1", "bob"));
        t.apply(&event(MessageType::UserJoined, "g1", "amy"));
        t.apply(&event(MessageType::UserJoined, "elsewhere", "zed"));
        assert_eq!(t.members("g1"), vec!["amy", "bob"]);
        assert!(t.members("elsewhere").is_empty());

        t.apply(&event(MessageType::UserLeft, "g1", "bob"));
        assert_eq!(t.members("g1"), vec!["amy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_without_stop() {
        let mut t = tracker();
        t.apply(&event(MessageType::Typing, "g1", "bob"));
        assert_eq!(t.typing_users("g1"), vec!["bob"]);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(t.typing_users("g1"), vec!["bob"]);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(t.typing_users("g1").is_empty());
        assert_eq!(t.prune_expired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_refresh_extends_ttl() {
        let mut t = tracker();
        t.apply(&event(MessageType::Typing, "g1", "bob"));
        tokio::time::advance(Duration::from_secs(6)).await;
        t.apply(&event(MessageType::Typing, "g1", "bob"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(t.typing_users("g1"), vec!["bob"]);
    }

    #[test]
    fn test_stop_typing_message_and_leave_clear_indicator() {
        let mut t = tracker();
        for user in ["a", "b", "c"] {
            t.apply(&event(MessageType::Typing, "g1", user));
        }
        t.apply(&event(MessageType::StopTyping, "g1", "a"));
        t.apply(&event(MessageType::GroupMessage, "g1", "b"));
        t.apply(&event(MessageType::UserLeft, "g1", "c"));
        assert!(t.typing_users("g1").is_empty());
    }

    #[test]
    fn test_leave_group_drops_state() {
        let mut t = tracker();
        t.apply(&event(MessageType::Typing, "g1", "bob"));
        t.leave("g1");
        t.join("g1");
        assert!(t.typing_users("g1").is_empty());
    }

    #[test]
    fn test_presence_overwrites_in_receipt_order() {
        let mut t = PresenceTracker::new(Duration::from_secs(8));
        let status = |s: &str| {
            Envelope::with_data(MessageType::UserStatusUpdate, json!({ "userId": "bob", "status": s }))
        };

        t.apply(&status("online"));
        assert_eq!(t.presence("bob").unwrap().status, PresenceStatus::Online);
        t.apply(&status("offline"));
        t.apply(&status("busy"));
        assert_eq!(t.presence("bob").unwrap().status, PresenceStatus::Unknown);
        assert!(t.presence("amy").is_none());
    }

    #[test]
    fn test_clear_typing_keeps_membership_and_presence() {
        let mut t = tracker();
        t.apply(&event(MessageType::Typing, "g1", "bob"));
        t.set_presence("bob", PresenceStatus::Online);
        t.clear_typing();
        assert!(t.typing_users("g1").is_empty());
        assert!(t.is_member("g1"));
        assert!(t.presence("bob").is_some());

        t.clear_all();
        assert!(t.groups().is_empty());
        assert!(t.presence("bob").is_none());
    }

    #[test]
    fn test_malformed_events_ignored() {
        let mut t = tracker();
        t.apply(&Envelope::with_data(MessageType::Typing, json!({ "groupId": "g1" })));
        t.apply(&Envelope::with_data(MessageType::UserStatusUpdate, json!({})));
        assert!(t.typing_users("g1").is_empty());
    }
}
