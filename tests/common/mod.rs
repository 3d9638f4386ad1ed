//! Common test utilities
//!
//! A scripted in-memory connector so session behavior can be driven without
//! sockets, plus a few helpers for waiting on session events.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

use groupchat_session::error::{Error, Result};
use groupchat_session::session::{Identity, Session, SessionEvent, SessionSettings};
use groupchat_session::transport::{CloseCode, Connector, Transport};

/// How long helpers wait before failing a test
pub const WAIT: Duration = Duration::from_secs(120);

// ─────────────────────────────────────────────────────────────────
// Mock Connector
// ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ConnectorState {
    failures_remaining: u32,
    send_budget: Option<usize>,
    attempts: Vec<Instant>,
}

/// Connector whose attempts fail on demand and whose connections are
/// handed to the test as [`MockPeer`]s
#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(ConnectorState::default())),
                peers,
            },
            peers_rx,
        )
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_remaining = n;
    }

    /// The next connection accepts `n` frames, then refuses every send
    pub fn fail_send_after(&self, n: usize) {
        self.state.lock().send_budget = Some(n);
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Time between consecutive connection attempts
    pub fn gaps(&self) -> Vec<Duration> {
        self.state
            .lock()
            .attempts
            .windows(2)
            .map(|w| w[1].duration_since(w[0]))
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Transport = MockTransport;

    async fn connect(&self, url: &Url) -> Result<MockTransport> {
        let sends_left = {
            let mut state = self.state.lock();
            state.attempts.push(Instant::now());
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(Error::connection_failed(url.as_str(), "connection refused"));
            }
            state.send_budget.take()
        };

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(None));

        let _ = self.peers.send(MockPeer {
            inbound: Some(to_client),
            sent: from_client,
            closed: closed.clone(),
        });

        Ok(MockTransport {
            inbound: from_server,
            outbound: to_server,
            closed,
            sends_left,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Transport
// ─────────────────────────────────────────────────────────────────

pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<Mutex<Option<CloseCode>>>,
    sends_left: Option<usize>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        if let Some(ref mut left) = self.sends_left {
            if *left == 0 {
                return Err(Error::connection_closed("send refused"));
            }
            *left -= 1;
        }
        self.outbound
            .send(text)
            .map_err(|_| Error::connection_closed("peer went away"))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: CloseCode) -> Result<()> {
        *self.closed.lock() = Some(code);
        Ok(())
    }
}

/// Server end of one mock connection
pub struct MockPeer {
    inbound: Option<mpsc::UnboundedSender<String>>,
    sent: mpsc::UnboundedReceiver<String>,
    closed: Arc<Mutex<Option<CloseCode>>>,
}

impl MockPeer {
    /// Deliver a frame to the client
    pub fn push(&self, frame: Value) {
        self.push_raw(frame.to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        if let Some(ref inbound) = self.inbound {
            let _ = inbound.send(text.into());
        }
    }

    /// Next frame the client sent, parsed
    pub async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client transport dropped");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Next `n` frames' `type` fields
    pub async fn next_types(&mut self, n: usize) -> Vec<String> {
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            let frame = self.next_frame().await;
            types.push(frame["type"].as_str().unwrap_or_default().to_string());
        }
        types
    }

    /// Frames already sent and not yet read
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            frames.push(serde_json::from_str(&text).expect("client sent invalid JSON"));
        }
        frames
    }

    /// End the connection from the server side
    pub fn drop_connection(&mut self) {
        self.inbound = None;
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        *self.closed.lock()
    }
}

// ─────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────

pub fn test_url() -> Url {
    Url::parse("ws://chat.test/ws").unwrap()
}

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        base_delay: Duration::from_millis(100),
        cap_delay: Duration::from_secs(2),
        max_reconnect_attempts: 0,
        request_timeout: Duration::from_secs(5),
        typing_ttl: Duration::from_secs(8),
        max_pending: 0,
        attach_correlation_id: true,
    }
}

pub fn start_session(
    settings: SessionSettings,
) -> (
    Session,
    mpsc::UnboundedReceiver<SessionEvent>,
    MockConnector,
    mpsc::UnboundedReceiver<MockPeer>,
) {
    let (connector, peers) = MockConnector::new();
    let (session, events) = Session::start_with(
        test_url(),
        settings,
        Identity::new("u-self", "Self"),
        connector.clone(),
    );
    (session, events, connector, peers)
}

pub async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
    tokio::time::timeout(WAIT, peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Skip events until one matches; returns it and everything skipped before it
pub async fn wait_for<F>(
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut predicate: F,
) -> (SessionEvent, Vec<SessionEvent>)
where
    F: FnMut(&SessionEvent) -> bool,
{
    let mut skipped = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("session event channel closed");
        if predicate(&event) {
            return (event, skipped);
        }
        skipped.push(event);
    }
}

pub async fn wait_ready(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> bool {
    match wait_for(events, |e| matches!(e, SessionEvent::Ready { .. })).await.0 {
        SessionEvent::Ready { reconnected } => reconnected,
        _ => unreachable!(),
    }
}
