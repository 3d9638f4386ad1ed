//! Event dispatcher
//!
//! Typed publish/subscribe registry: each [`MessageType`] maps to an ordered
//! list of subscriptions, dispatched in registration order. Handles returned
//! by [`Dispatcher::on`] remove a subscription; callbacks are never compared.
//!
//! Callbacks run outside the registry lock, so a callback may subscribe or
//! unsubscribe freely. A panicking callback is logged and skipped; the rest
//! of the subscribers for that envelope still run.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::protocol::{Envelope, MessageType};

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handle for removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    kind: MessageType,
    seq: u64,
}

impl SubscriptionId {
    pub fn message_type(&self) -> MessageType {
        self.kind
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.seq)
    }
}

/// Which envelopes of a type reach a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Filter {
    Any,
    /// Only envelopes echoing this id
    Correlated(String),
    /// Envelopes echoing this id, or carrying no id at all
    CorrelatedOrBare(String),
}

impl Filter {
    fn matches(&self, envelope: &Envelope) -> bool {
        match self {
            Filter::Any => true,
            Filter::Correlated(id) => envelope.correlation_id() == Some(id.as_str()),
            Filter::CorrelatedOrBare(id) => match envelope.correlation_id() {
                Some(echoed) => echoed == id,
                None => true,
            },
        }
    }
}

impl From<Option<String>> for Filter {
    fn from(correlation_id: Option<String>) -> Self {
        correlation_id.map_or(Filter::Any, Filter::Correlated)
    }
}

struct Subscription {
    seq: u64,
    callback: Callback,
    once: bool,
    filter: Filter,
}

impl Subscription {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.filter.matches(envelope)
    }
}

#[derive(Default)]
struct Registry {
    next_seq: u64,
    by_type: HashMap<MessageType, Vec<Subscription>>,
}

#[derive(Default)]
pub struct Dispatcher {
    registry: Mutex<Registry>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Durable subscription
    pub fn on<F>(&self, kind: MessageType, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(callback), false, Filter::Any)
    }

    /// Subscription that removes itself after its first invocation
    pub fn once<F>(&self, kind: MessageType, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.subscribe(kind, Arc::new(callback), true, Filter::Any)
    }

    pub(crate) fn subscribe(
        &self,
        kind: MessageType,
        callback: Callback,
        once: bool,
        filter: Filter,
    ) -> SubscriptionId {
        let mut registry = self.registry.lock();
        let seq = registry.next_seq;
        registry.next_seq += 1;

        registry.by_type.entry(kind).or_default().push(Subscription {
            seq,
            callback,
            once,
            filter,
        });

        SubscriptionId { kind, seq }
    }

    /// Remove one subscription; false if it was already gone
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(subs) = registry.by_type.get_mut(&id.kind) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|s| s.seq != id.seq);
        let removed = subs.len() != before;

        if subs.is_empty() {
            registry.by_type.remove(&id.kind);
        }
        removed
    }

    /// Remove every subscription for a type; returns how many were removed
    pub fn off_all(&self, kind: MessageType) -> usize {
        self.registry
            .lock()
            .by_type
            .remove(&kind)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// Number of live subscriptions for a type
    pub fn subscription_count(&self, kind: MessageType) -> usize {
        self.registry
            .lock()
            .by_type
            .get(&kind)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of live subscriptions across all types
    pub fn total_subscriptions(&self) -> usize {
        self.registry.lock().by_type.values().map(Vec::len).sum()
    }

    /// Deliver one inbound envelope; returns how many callbacks ran
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let callbacks = self.collect(envelope);

        for (seq, callback) in &callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(envelope))) {
                error!(
                    message_type = %envelope.kind(),
                    subscription = seq,
                    panic = %panic_message(&panic),
                    "Subscriber panicked; continuing with remaining subscribers"
                );
            }
        }

        trace!(message_type = %envelope.kind(), subscribers = callbacks.len(), "Dispatched");
        callbacks.len()
    }

    /// Snapshot matching callbacks in order; once-subscriptions are removed here
    fn collect(&self, envelope: &Envelope) -> Vec<(u64, Callback)> {
        let mut registry = self.registry.lock();
        let kind = envelope.kind();
        let Some(subs) = registry.by_type.get_mut(&kind) else {
            return Vec::new();
        };

        let matched: Vec<(u64, Callback)> = subs
            .iter()
            .filter(|s| s.matches(envelope))
            .map(|s| (s.seq, s.callback.clone()))
            .collect();

        subs.retain(|s| !(s.once && s.matches(envelope)));
        if subs.is_empty() {
            registry.by_type.remove(&kind);
        }

        matched
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &'static str| -> Callback {
            let log = log_clone.clone();
            Arc::new(move |_: &Envelope| log.lock().push(tag.to_string()))
        };
        (log, make)
    }

    fn envelope(kind: MessageType) -> Envelope {
        Envelope::with_data(kind, json!({ "groupId": "g1" }))
    }

    #[test]
    fn test_registration_order() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::GroupMessage, make("a"), false, Filter::Any);
        dispatcher.subscribe(MessageType::GroupMessage, make("b"), false, Filter::Any);
        dispatcher.subscribe(MessageType::UserJoined, make("other"), false, Filter::Any);
        dispatcher.subscribe(MessageType::GroupMessage, make("c"), false, Filter::Any);

        assert_eq!(dispatcher.dispatch(&envelope(MessageType::GroupMessage)), 3);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_once_removed_after_first_dispatch() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::Typing, make("once"), true, Filter::Any);
        dispatcher.subscribe(MessageType::Typing, make("durable"), false, Filter::Any);

        dispatcher.dispatch(&envelope(MessageType::Typing));
        dispatcher.dispatch(&envelope(MessageType::Typing));

        assert_eq!(*log.lock(), vec!["once", "durable", "durable"]);
        assert_eq!(dispatcher.subscription_count(MessageType::Typing), 1);
    }

    #[test]
    fn test_off_by_handle() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        let a = dispatcher.subscribe(MessageType::GroupMessage, make("a"), false, Filter::Any);
        dispatcher.subscribe(MessageType::GroupMessage, make("b"), false, Filter::Any);

        assert!(dispatcher.off(a));
        assert!(!dispatcher.off(a));
        dispatcher.dispatch(&envelope(MessageType::GroupMessage));
        assert_eq!(*log.lock(), vec!["b"]);
    }

    #[test]
    fn test_off_all() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(MessageType::UserLeft, |_| {});
        dispatcher.on(MessageType::UserLeft, |_| {});
        dispatcher.on(MessageType::UserJoined, |_| {});

        assert_eq!(dispatcher.off_all(MessageType::UserLeft), 2);
        assert_eq!(dispatcher.off_all(MessageType::UserLeft), 0);
        assert_eq!(dispatcher.total_subscriptions(), 1);
    }

    #[test]
    fn test_panicking_subscriber_isolated() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::GroupMessage, make("before"), false, Filter::Any);
        dispatcher.on(MessageType::GroupMessage, |_| panic!("subscriber bug"));
        dispatcher.subscribe(MessageType::GroupMessage, make("after"), false, Filter::Any);

        assert_eq!(dispatcher.dispatch(&envelope(MessageType::GroupMessage)), 3);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn test_correlation_filter() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::UserStatusInfo, make("req-1"), true, Filter::Correlated("1".into()));
        dispatcher.subscribe(MessageType::UserStatusInfo, make("req-2"), true, Filter::Correlated("2".into()));

        let reply = envelope(MessageType::UserStatusInfo).with_correlation_id("2");
        assert_eq!(dispatcher.dispatch(&reply), 1);
        assert_eq!(*log.lock(), vec!["req-2"]);
        assert_eq!(dispatcher.subscription_count(MessageType::UserStatusInfo), 1);

        // no id on the reply: filtered subscriptions don't match
        assert_eq!(dispatcher.dispatch(&envelope(MessageType::UserStatusInfo)), 0);
    }

    #[test]
    fn test_bare_envelopes_reach_lenient_filter() {
        let dispatcher = Dispatcher::new();
        let (log, make) = recorder();

        dispatcher.subscribe(MessageType::LoadMessagesError, make("strict"), true, Filter::Correlated("7".into()));
        dispatcher.subscribe(
            MessageType::LoadMessagesError,
            make("lenient"),
            true,
            Filter::CorrelatedOrBare("7".into()),
        );

        // someone else's error reaches neither
        let foreign = envelope(MessageType::LoadMessagesError).with_correlation_id("8");
        assert_eq!(dispatcher.dispatch(&foreign), 0);

        assert_eq!(dispatcher.dispatch(&envelope(MessageType::LoadMessagesError)), 1);
        assert_eq!(*log.lock(), vec!["lenient"]);
        assert_eq!(dispatcher.subscription_count(MessageType::LoadMessagesError), 1);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let d = dispatcher.clone();
        let s = slot.clone();
        let id = dispatcher.on(MessageType::StopTyping, move |_| {
            if let Some(id) = s.lock().take() {
                d.off(id);
            }
        });
        *slot.lock() = Some(id);

        assert_eq!(dispatcher.dispatch(&envelope(MessageType::StopTyping)), 1);
        assert_eq!(dispatcher.subscription_count(MessageType::StopTyping), 0);
    }
}
