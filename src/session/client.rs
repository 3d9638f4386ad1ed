//! Session handle and the session loop
//!
//! One spawned task owns the transport and drives every transition:
//! - `disconnected` → `connecting` on [`Session::connect`]
//! - `connecting` → `connected` when the connector returns a transport
//! - `connecting`/`connected` → `reconnecting` on failure, with
//!   `min(base * 2^attempt, cap)` backoff, until attempts run out
//! - any → `disconnected` on [`Session::disconnect`]
//!
//! Inbound frames are folded into the presence tracker and then dispatched,
//! in arrival order, on that same task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::correlation::{new_correlation_id, Correlator};
use super::dispatcher::{Dispatcher, SubscriptionId};
use super::presence::PresenceEntry;
use super::state::{ConnectionState, Identity, ReconnectBackoff, SessionSettings, SessionState};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, GroupRef, JoinCommunity, MessageType, UpdateStatus};
use crate::transport::{CloseCode, Connector, Transport};
use crate::version::build_info;

// ─────────────────────────────────────────────────────────────────
// Commands & Events
// ─────────────────────────────────────────────────────────────────

/// Commands from handles to the session loop
#[derive(Debug)]
enum SessionCommand {
    Connect,
    Disconnect(oneshot::Sender<()>),
}

/// Lifecycle notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// `connectionState` changed
    StateChanged(ConnectionState),

    /// Transport open, state restored and queue drained
    Ready { reconnected: bool },

    /// A retry is scheduled
    Reconnecting { attempt: u32, delay: Duration },

    /// Gave up after the configured number of attempts
    ReconnectExhausted { attempts: u32 },

    /// An open connection dropped without being asked to
    ConnectionLost { reason: String },
}

// ─────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) correlator: Correlator,
    pub(crate) settings: SessionSettings,
    flush: Notify,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_connection(&self, state: &mut SessionState, next: ConnectionState) {
        if state.connection == next {
            return;
        }
        debug!(from = %state.connection, to = %next, "Connection state changed");
        state.connection = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        self.set_connection(&mut state, next);
    }
}

// ─────────────────────────────────────────────────────────────────
// Session Handle
// ─────────────────────────────────────────────────────────────────

/// Handle to a running session; cheap to clone
///
/// The session loop exits once every handle is dropped.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl Session {
    /// Spawn a session loop on the current runtime
    ///
    /// The session starts `disconnected`; call [`Session::connect`] to open it.
    pub fn start<C: Connector>(
        config: &SessionConfig,
        identity: Identity,
        connector: C,
    ) -> Result<(Session, mpsc::UnboundedReceiver<SessionEvent>)> {
        let url = config.server_url()?;
        Ok(Self::start_with(url, SessionSettings::from_config(config), identity, connector))
    }

    /// Spawn a session loop with explicit settings
    pub fn start_with<C: Connector>(
        url: Url,
        settings: SessionSettings,
        identity: Identity,
        connector: C,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState::new(identity, &settings)),
            dispatcher: Dispatcher::new(),
            correlator: Correlator::new(),
            settings,
            flush: Notify::new(),
            state_tx,
            events: events_tx,
        });

        let session_loop = SessionLoop {
            shared: shared.clone(),
            connector,
            url,
            commands: commands_rx,
            backoff: ReconnectBackoff::new(shared.settings.base_delay, shared.settings.cap_delay),
        };
        tokio::spawn(session_loop.run());

        (
            Session {
                shared,
                commands: commands_tx,
            },
            events_rx,
        )
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Open the connection
    ///
    /// No-op while connecting or connected. While reconnecting, the pending
    /// timer is skipped and the next attempt starts immediately.
    pub fn connect(&self) -> Result<()> {
        self.commands
            .send(SessionCommand::Connect)
            .map_err(|_| Error::SessionClosed)
    }

    /// Close the connection on purpose
    ///
    /// Cancels any reconnect timer, closes with a normal code, clears the
    /// queue, fails pending requests with [`Error::Disconnected`] and forgets
    /// membership and presence. Subscriptions are kept.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Disconnect(tx))
            .map_err(|_| Error::SessionClosed)?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    /// Follow state changes
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.state.lock().reconnect_attempt
    }

    pub fn identity(&self) -> Identity {
        self.shared.state.lock().identity.clone()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    // ─────────────────────────────────────────────────────────────
    // Sending
    // ─────────────────────────────────────────────────────────────

    /// Queue an envelope for delivery
    ///
    /// Never fails because the session is offline: the envelope waits in the
    /// queue and goes out in submission order once connected. Fails only when
    /// a capped queue overflows, in which case the oldest envelope is lost.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let kind = envelope.kind();
        let result = {
            let mut state = self.shared.state.lock();
            let result = state.queue.push(envelope);
            trace!(message_type = %kind, pending = state.queue.len(), connected = state.is_connected(), "Queued envelope");
            result
        };
        self.shared.flush.notify_one();

        if let Err(ref e) = result {
            warn!(error = %e, "Outbound queue overflow");
        }
        result
    }

    /// Edit state and, only while connected, queue the resulting declaration
    ///
    /// While offline the edit alone is enough: the restore step re-declares
    /// membership and status on the next open, so nothing is sent twice.
    pub(crate) fn declare<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut SessionState) -> Result<Option<Envelope>>,
    {
        let result = {
            let mut state = self.shared.state.lock();
            let Some(envelope) = update(&mut state)? else {
                return Ok(());
            };
            if !state.is_connected() {
                trace!(message_type = %envelope.kind(), "Offline, deferring declaration to restore");
                return Ok(());
            }
            state.queue.push(envelope)
        };
        self.shared.flush.notify_one();
        result
    }

    /// Envelopes waiting for a connection
    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    // ─────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────

    /// Subscribe to an inbound message type; survives reconnects
    pub fn on<F>(&self, kind: MessageType, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(kind, callback)
    }

    /// Subscribe for the next envelope of a type only
    pub fn once<F>(&self, kind: MessageType, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.dispatcher.once(kind, callback)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.off(id)
    }

    pub fn off_all(&self, kind: MessageType) -> usize {
        self.shared.dispatcher.off_all(kind)
    }

    /// Registry introspection
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.shared.dispatcher
    }

    // ─────────────────────────────────────────────────────────────
    // Requests
    // ─────────────────────────────────────────────────────────────

    /// Send `envelope` and wait for the next `response_type`
    pub async fn request(
        &self,
        envelope: Envelope,
        response_type: MessageType,
        timeout: Duration,
    ) -> Result<Envelope> {
        self.request_with_errors(envelope, response_type, &[], timeout).await
    }

    /// Like [`Session::request`], but any of `error_types` rejects the request
    ///
    /// Matching is by correlation id when the envelope carries one, and by
    /// type alone otherwise.
    pub async fn request_with_errors(
        &self,
        envelope: Envelope,
        response_type: MessageType,
        error_types: &[MessageType],
        timeout: Duration,
    ) -> Result<Envelope> {
        let pending = self.shared.correlator.register(
            &self.shared.dispatcher,
            &envelope,
            response_type,
            error_types,
        )?;

        debug!(
            message_type = %envelope.kind(),
            response_type = %response_type,
            correlation_id = ?envelope.correlation_id(),
            "Sending request"
        );
        self.send(envelope)?;

        pending.wait(timeout).await
    }

    pub fn new_correlation_id() -> String {
        new_correlation_id()
    }

    /// Requests waiting for a response
    pub fn requests_in_flight(&self) -> usize {
        self.shared.correlator.in_flight()
    }

    // ─────────────────────────────────────────────────────────────
    // Presence Queries
    // ─────────────────────────────────────────────────────────────

    /// Joined groups, sorted
    pub fn groups(&self) -> Vec<String> {
        self.shared.state.lock().presence.groups()
    }

    pub fn is_member(&self, group_id: &str) -> bool {
        self.shared.state.lock().presence.is_member(group_id)
    }

    pub fn members(&self, group_id: &str) -> Vec<String> {
        self.shared.state.lock().presence.members(group_id)
    }

    /// Users currently typing in a group, with expired indicators excluded
    pub fn typing_users(&self, group_id: &str) -> Vec<String> {
        self.shared.state.lock().presence.typing_users(group_id)
    }

    pub fn presence(&self, user_id: &str) -> Option<PresenceEntry> {
        self.shared.state.lock().presence.presence(user_id).cloned()
    }
}

// ─────────────────────────────────────────────────────────────────
// Session Loop
// ─────────────────────────────────────────────────────────────────

/// How a connection (or connection attempt) ended
enum Ended {
    /// Lost without being asked to; reconnect
    Lost(String),
    /// `disconnect()` was called
    Disconnected(oneshot::Sender<()>),
    /// Every handle dropped
    Shutdown,
}

struct SessionLoop<C: Connector> {
    shared: Arc<Shared>,
    connector: C,
    url: Url,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    backoff: ReconnectBackoff,
}

impl<C: Connector> SessionLoop<C> {
    async fn run(mut self) {
        debug!(url = %self.url, "Session loop started");

        // disconnected: wait for connect()
        while let Some(command) = self.commands.recv().await {
            match command {
                SessionCommand::Connect => {}
                SessionCommand::Disconnect(ack) => {
                    self.stop();
                    let _ = ack.send(());
                    continue;
                }
            }

            match self.run_connected_cycle().await {
                Ended::Disconnected(ack) => {
                    self.stop();
                    let _ = ack.send(());
                }
                Ended::Shutdown => break,
                Ended::Lost(_) => {}
            }
        }

        self.shared.transition(ConnectionState::Disconnected);
        self.shared.correlator.fail_all();
        debug!("Session loop terminated");
    }

    /// Connect, run, and reconnect until asked to stop or attempts run out
    async fn run_connected_cycle(&mut self) -> Ended {
        self.shared.state.lock().reconnect_attempt = 0;
        self.backoff.reset();

        loop {
            self.shared.transition(ConnectionState::Connecting);
            info!(url = %self.url, "Connecting");

            let outcome = match self.open().await {
                Ok(Ok(transport)) => self.serve(transport).await,
                Ok(Err(e)) => {
                    warn!(url = %self.url, error = %e, "Connection attempt failed");
                    Ended::Lost(e.to_string())
                }
                Err(ended) => ended,
            };

            match outcome {
                Ended::Lost(_) => {}
                other => return other,
            }

            if let Some(ended) = self.wait_before_retry().await {
                return ended;
            }
        }
    }

    /// Run the connector while still answering commands
    async fn open(&mut self) -> std::result::Result<Result<C::Transport>, Ended> {
        let connect = self.connector.connect(&self.url);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Ok(result),
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Connect) => continue,
                    Some(SessionCommand::Disconnect(ack)) => return Err(Ended::Disconnected(ack)),
                    None => return Err(Ended::Shutdown),
                },
            }
        }
    }

    /// Schedule the next attempt; `Some` if the cycle should end instead
    async fn wait_before_retry(&mut self) -> Option<Ended> {
        let max_attempts = self.shared.settings.max_reconnect_attempts;

        let attempt = {
            let mut state = self.shared.state.lock();
            if max_attempts > 0 && state.reconnect_attempt >= max_attempts {
                let attempts = state.reconnect_attempt;
                drop(state);
                error!(attempts, max = max_attempts, "Max reconnection attempts reached");
                self.shared.transition(ConnectionState::Disconnected);
                self.shared.emit(SessionEvent::ReconnectExhausted { attempts });
                return Some(Ended::Lost("reconnect attempts exhausted".to_string()));
            }
            state.reconnect_attempt += 1;
            self.shared.set_connection(&mut state, ConnectionState::Reconnecting);
            state.reconnect_attempt
        };

        let delay = self.backoff.next_delay();
        info!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before reconnection");
        self.shared.emit(SessionEvent::Reconnecting { attempt, delay });

        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        tokio::select! {
            _ = &mut timer => None,
            command = self.commands.recv() => match command {
                Some(SessionCommand::Connect) => {
                    debug!(attempt, "Reconnect timer skipped by connect()");
                    None
                }
                Some(SessionCommand::Disconnect(ack)) => Some(Ended::Disconnected(ack)),
                None => Some(Ended::Shutdown),
            },
        }
    }

    /// Drive an open transport until it ends
    async fn serve(&mut self, mut transport: C::Transport) -> Ended {
        let restore = self.mark_connected();

        let ended = match self.restore(&mut transport, restore).await {
            Ok(()) => self.serve_frames(&mut transport).await,
            Err(e) => Ended::Lost(e.to_string()),
        };

        match ended {
            Ended::Lost(ref reason) => {
                warn!(reason = %reason, "Connection lost");
                self.shared.state.lock().presence.clear_typing();
                self.shared.emit(SessionEvent::ConnectionLost {
                    reason: reason.clone(),
                });
            }
            Ended::Disconnected(_) => {
                info!("Closing connection on request");
                if let Err(e) = transport.close(CloseCode::Normal).await {
                    debug!(error = %e, "Close handshake failed");
                }
            }
            Ended::Shutdown => {
                let _ = transport.close(CloseCode::GoingAway).await;
            }
        }
        ended
    }

    /// Enter `connected` and snapshot what must be re-declared, atomically
    fn mark_connected(&mut self) -> Vec<Envelope> {
        self.backoff.reset();

        let mut state = self.shared.state.lock();
        let reconnected = state.has_connected;
        state.has_connected = true;
        state.reconnect_attempt = 0;
        self.shared.set_connection(&mut state, ConnectionState::Connected);

        let mut restore = vec![Envelope::new(
            MessageType::JoinCommunity,
            &JoinCommunity {
                user_id: state.identity.user_id.clone(),
                username: state.identity.display_name.clone(),
                client: Some(build_info().client_tag()),
            },
        )];
        restore.extend(
            state
                .presence
                .groups()
                .into_iter()
                .map(|group_id| Envelope::new(MessageType::JoinGroup, &GroupRef { group_id })),
        );
        if let Some(status) = state.announced_status {
            restore.push(Envelope::new(MessageType::UpdateStatus, &UpdateStatus { status }));
        }
        drop(state);

        let restore: Vec<Envelope> = restore
            .into_iter()
            .filter_map(|encoded| {
                encoded
                    .map_err(|e| error!(error = %e, "Failed to encode restore envelope"))
                    .ok()
            })
            .collect();

        info!(reconnected, restored = restore.len(), "Session ready");
        self.shared.emit(SessionEvent::Ready { reconnected });
        restore
    }

    /// Re-declare identity, groups and status, then drain the queue
    async fn restore(&mut self, transport: &mut C::Transport, restore: Vec<Envelope>) -> Result<()> {
        for envelope in restore {
            trace!(message_type = %envelope.kind(), "Restoring session state");
            transport.send(envelope.to_json()?).await?;
        }
        self.flush(transport).await.map(|_| ())
    }

    /// Connected select loop
    async fn serve_frames(&mut self, transport: &mut C::Transport) -> Ended {
        let ttl = self.shared.settings.typing_ttl.max(Duration::from_millis(100));
        let mut prune = tokio::time::interval_at(tokio::time::Instant::now() + ttl, ttl);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = transport.recv() => match frame {
                    Some(Ok(text)) => self.handle_frame(&text),
                    Some(Err(Error::ProtocolMalformed { message })) => {
                        warn!(error = %message, "Dropping undecodable frame");
                    }
                    Some(Err(e)) => return Ended::Lost(e.to_string()),
                    None => return Ended::Lost("connection closed by peer".to_string()),
                },

                _ = self.shared.flush.notified() => {
                    if let Err(e) = self.flush(transport).await {
                        return Ended::Lost(e.to_string());
                    }
                }

                command = self.commands.recv() => match command {
                    Some(SessionCommand::Connect) => trace!("connect() while connected ignored"),
                    Some(SessionCommand::Disconnect(ack)) => return Ended::Disconnected(ack),
                    None => return Ended::Shutdown,
                },

                _ = prune.tick() => {
                    self.shared.state.lock().presence.prune_expired();
                }
            }
        }
    }

    /// Send queued envelopes head-to-tail; on failure the rest go back to the head
    async fn flush(&mut self, transport: &mut C::Transport) -> Result<usize> {
        let mut sent = 0;
        loop {
            let batch = {
                let mut state = self.shared.state.lock();
                if !state.is_connected() {
                    return Ok(sent);
                }
                state.queue.take_all()
            };
            if batch.is_empty() {
                if sent > 0 {
                    trace!(sent, "Outbound queue drained");
                }
                return Ok(sent);
            }

            let mut batch = batch.into_iter();
            while let Some(envelope) = batch.next() {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(message_type = %envelope.kind(), error = %e, "Dropping unencodable envelope");
                        continue;
                    }
                };

                if let Err(e) = transport.send(text).await {
                    let mut remaining = vec![envelope];
                    remaining.extend(batch);
                    warn!(requeued = remaining.len(), error = %e, "Send failed, requeueing");
                    self.shared.state.lock().queue.requeue_front(remaining);
                    return Err(e);
                }
                sent += 1;
            }
        }
    }

    /// Decode one frame, update presence, then dispatch
    fn handle_frame(&self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(Error::UnknownMessageType { message_type }) => {
                warn!(message_type = %message_type, "Dropping frame with unknown type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        trace!(
            message_type = %envelope.kind(),
            correlation_id = ?envelope.correlation_id(),
            "Received envelope"
        );

        self.shared.state.lock().presence.apply(&envelope);

        if envelope.kind().is_error() {
            warn!(message_type = %envelope.kind(), data = %envelope.data(), "Server reported an error");
        }

        if self.shared.dispatcher.dispatch(&envelope) == 0 {
            debug!(message_type = %envelope.kind(), "No subscribers for envelope");
        }
    }

    /// Explicit disconnect: forget everything but subscriptions
    fn stop(&mut self) {
        self.backoff.reset();

        let dropped = {
            let mut state = self.shared.state.lock();
            let dropped = state.queue.clear();
            state.presence.clear_all();
            state.reconnect_attempt = 0;
            state.announced_status = None;
            self.shared.set_connection(&mut state, ConnectionState::Disconnected);
            dropped
        };

        let failed = self.shared.correlator.fail_all();
        info!(dropped_envelopes = dropped, failed_requests = failed, "Session disconnected");
    }
}
