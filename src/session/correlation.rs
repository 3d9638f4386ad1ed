//! Correlation layer: request/response on top of the event stream
//!
//! A request registers one-shot subscriptions for its response type, the
//! error type paired with it, and any extra error types before the request envelope is queued, then waits with a
//! deadline. Whatever settles first wins: the response, a server error, the
//! timeout, or an explicit disconnect. Dropping the [`PendingRequest`]
//! removes every subscription it registered, so none outlive the request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use super::dispatcher::{Callback, Dispatcher, Filter, SubscriptionId};
use crate::error::{Error, Result};
use crate::protocol::{Envelope, MessageType};

type Outcome = Result<Envelope>;
type Slot = Arc<Mutex<Option<oneshot::Sender<Outcome>>>>;

/// Mint a fresh correlation id
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

struct Pending {
    response_type: MessageType,
    correlation_id: Option<String>,
    slot: Slot,
}

/// Book of in-flight requests
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u64, Pending>>,
    next_key: Mutex<u64>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register subscriptions for a request about to be sent
    ///
    /// `envelope` is only inspected for its correlation id; sending it is the
    /// caller's job and must happen after this returns.
    pub fn register<'a>(
        &'a self,
        dispatcher: &'a Dispatcher,
        envelope: &Envelope,
        response_type: MessageType,
        error_types: &[MessageType],
    ) -> Result<PendingRequest<'a>> {
        let correlation_id = envelope.correlation_id().map(str::to_string);
        let (tx, rx) = oneshot::channel();
        let slot: Slot = Arc::new(Mutex::new(Some(tx)));

        let key = {
            let mut pending = self.pending.lock();

            if correlation_id.is_none()
                && pending
                    .values()
                    .any(|p| p.response_type == response_type && p.correlation_id.is_none())
            {
                return Err(Error::RequestInFlight { response_type });
            }

            let mut next = self.next_key.lock();
            let key = *next;
            *next += 1;

            pending.insert(
                key,
                Pending {
                    response_type,
                    correlation_id: correlation_id.clone(),
                    slot: slot.clone(),
                },
            );
            key
        };

        let mut subscriptions = Vec::with_capacity(error_types.len() + 3);
        subscriptions.push(dispatcher.subscribe(
            response_type,
            resolve_with(slot.clone()),
            true,
            Filter::from(correlation_id.clone()),
        ));

        let mut rejecting: Vec<MessageType> = error_types.to_vec();
        if let Some(paired) = response_type.paired_error() {
            if !rejecting.contains(&paired) {
                rejecting.push(paired);
            }
        }
        // a generic error can only be attributed when it echoes our id
        if correlation_id.is_some() && !rejecting.contains(&MessageType::Error) {
            rejecting.push(MessageType::Error);
        }
        for kind in rejecting {
            if kind == response_type {
                continue;
            }
            // a typed error names its request by type, so one without an id still counts
            let filter = match correlation_id {
                Some(ref id) if kind != MessageType::Error => Filter::CorrelatedOrBare(id.clone()),
                _ => Filter::from(correlation_id.clone()),
            };
            subscriptions.push(dispatcher.subscribe(kind, reject_with(slot.clone()), true, filter));
        }

        debug!(
            response_type = %response_type,
            correlation_id = ?correlation_id,
            subscriptions = subscriptions.len(),
            "Registered pending request"
        );

        Ok(PendingRequest {
            correlator: self,
            dispatcher,
            key,
            response_type,
            subscriptions,
            rx: Some(rx),
        })
    }

    /// Settle every in-flight request with `Error::Disconnected`
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let mut failed = 0;
        for pending in drained {
            if let Some(tx) = pending.slot.lock().take() {
                let _ = tx.send(Err(Error::Disconnected));
                failed += 1;
            }
        }
        failed
    }

    /// Number of requests still waiting
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    fn forget(&self, key: u64) {
        self.pending.lock().remove(&key);
    }
}

fn resolve_with(slot: Slot) -> Callback {
    Arc::new(move |envelope: &Envelope| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(Ok(envelope.clone()));
        }
    })
}

fn reject_with(slot: Slot) -> Callback {
    Arc::new(move |envelope: &Envelope| {
        if let Some(tx) = slot.lock().take() {
            let _ = tx.send(Err(Error::ServerRejected {
                message_type: envelope.kind(),
                data: envelope.data().clone(),
            }));
        }
    })
}

/// A registered request waiting for its outcome
pub struct PendingRequest<'a> {
    correlator: &'a Correlator,
    dispatcher: &'a Dispatcher,
    key: u64,
    response_type: MessageType,
    subscriptions: Vec<SubscriptionId>,
    rx: Option<oneshot::Receiver<Outcome>>,
}

impl PendingRequest<'_> {
    /// Wait for the response, an error envelope, disconnect, or the deadline
    pub async fn wait(mut self, timeout: Duration) -> Result<Envelope> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::Internal("pending request awaited twice".to_string()));
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_) => {
                debug!(response_type = %self.response_type, "Request timed out");
                Err(Error::RequestTimeout {
                    response_type: self.response_type,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.dispatcher.off(id);
        }
        self.correlator.forget(self.key);
    }
}
