//! Outbound queue
//!
//! Every outbound envelope passes through here. The session loop drains it
//! head-to-tail while connected; anything a failed drain could not deliver
//! goes back to the head so submission order survives the next reconnect.
//!
//! With `max_pending = 0` the queue is unbounded. A non-zero cap makes it
//! lossy on purpose: the oldest envelope is discarded and the caller gets
//! [`Error::QueueOverflow`].

use std::collections::VecDeque;

use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::Envelope;

pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    max_pending: usize,
}

impl OutboundQueue {
    pub fn new(max_pending: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_pending,
        }
    }

    /// Append to the tail
    ///
    /// On overflow the envelope is still queued and the oldest one is gone.
    pub fn push(&mut self, envelope: Envelope) -> Result<()> {
        self.items.push_back(envelope);

        match self.evict_overflow() {
            Some(dropped) => Err(Error::QueueOverflow {
                capacity: self.max_pending,
                dropped: dropped.kind(),
            }),
            None => Ok(()),
        }
    }

    /// Take everything, head first
    pub fn take_all(&mut self) -> Vec<Envelope> {
        self.items.drain(..).collect()
    }

    /// Put undelivered envelopes back at the head, keeping their order
    pub fn requeue_front(&mut self, remaining: Vec<Envelope>) {
        for envelope in remaining.into_iter().rev() {
            self.items.push_front(envelope);
        }
        while let Some(dropped) = self.evict_overflow() {
            warn!(
                message_type = %dropped.kind(),
                capacity = self.max_pending,
                "Outbound queue full after requeue, dropped oldest envelope"
            );
        }
    }

    /// Drop everything; returns how many envelopes were discarded
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        (self.max_pending > 0).then_some(self.max_pending)
    }

    fn evict_overflow(&mut self) -> Option<Envelope> {
        if self.max_pending > 0 && self.items.len() > self.max_pending {
            self.items.pop_front()
        } else {
            None
        }
    }
}
