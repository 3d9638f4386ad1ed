//! Real-time session coordinator
//!
//! Keeps one logical connection to the group-messaging server alive and
//! layers ordered delivery, subscriptions, request/response correlation and
//! presence tracking on top of it.

mod client;
mod correlation;
mod dispatcher;
mod operations;
mod presence;
mod queue;
mod state;

pub use client::{Session, SessionEvent};
pub use correlation::{new_correlation_id, Correlator, PendingRequest};
pub use dispatcher::{Callback, Dispatcher, SubscriptionId};
pub use presence::{PresenceEntry, PresenceTracker};
pub use queue::OutboundQueue;
pub use state::{ConnectionState, Identity, ReconnectBackoff, SessionSettings};
