//! Integration tests against a real WebSocket server
//!
//! Tests the full flow: connect → join → request/response → server drop →
//! reconnect and restore, over tokio-tungstenite.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};

use common::{wait_for, wait_ready};
use groupchat_session::protocol::{LoadGroupMessages, MessageType, PresenceStatus};
use groupchat_session::session::{ConnectionState, Identity, Session, SessionEvent, SessionSettings};
use groupchat_session::transport::WebSocketConnector;
use groupchat_session::SessionConfig;

/// Mock group-messaging server
struct MockChatServer {
    addr: SocketAddr,
    shutdown_tx: Option<mpsc::Sender<()>>,
    frames: Arc<RwLock<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
}

impl MockChatServer {
    /// Start a server; with `drop_first` the first connection is closed
    /// right after `join_community`
    async fn start(drop_first: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let frames = Arc::new(RwLock::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let frames_clone = frames.clone();
        let connections_clone = connections.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        if let Ok((stream, _)) = accept_result {
                            let index = connections_clone.fetch_add(1, Ordering::SeqCst);
                            let frames = frames_clone.clone();
                            let hang_up = drop_first && index == 0;
                            tokio::spawn(handle_connection(stream, frames, hang_up));
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            frames,
            connections,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn types(&self) -> Vec<String> {
        self.frames
            .read()
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockChatServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Answer the client like a group-messaging server would
async fn handle_connection(stream: TcpStream, frames: Arc<RwLock<Vec<Value>>>, hang_up: bool) {
    let Ok(ws_stream) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();
    let mut user_id = String::new();

    while let Some(Ok(msg)) = read.next().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        frames.write().push(frame.clone());

        let data = &frame["data"];
        let correlation_id = frame.get("correlationId").cloned().unwrap_or(Value::Null);

        let response = match frame["type"].as_str().unwrap_or_default() {
            "join_community" => {
                user_id = data["userId"].as_str().unwrap_or_default().to_string();
                if hang_up {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return;
                }
                None
            }
            "join_group" => Some(json!({
                "type": "user_joined",
                "data": { "groupId": data["groupId"], "userId": user_id },
            })),
            "send_group_message" => Some(json!({
                "type": "group_message",
                "data": {
                    "groupId": data["groupId"],
                    "userId": user_id,
                    "content": data["content"],
                },
            })),
            "load_group_messages" if data["groupId"] == "missing" => Some(json!({
                "type": "load_messages_error",
                "data": { "message": "Group not found" },
                "correlationId": correlation_id,
            })),
            "load_group_messages" => Some(json!({
                "type": "group_messages_loaded",
                "data": { "groupId": data["groupId"], "messages": [{ "id": "m1", "content": "earlier" }] },
                "correlationId": correlation_id,
            })),
            "get_user_status" => Some(json!({
                "type": "user_status_info",
                "data": { "userId": data["userId"], "status": "online" },
                "correlationId": correlation_id,
            })),
            _ => None,
        };

        if let Some(response) = response {
            if write.send(WsMessage::Text(response.to_string())).await.is_err() {
                break;
            }
        }
    }
}

fn start_session(server: &MockChatServer) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
    let mut config = SessionConfig::default();
    config.server.url = server.ws_url();
    config.reconnect.base_delay_ms = 50;
    config.reconnect.cap_delay_ms = 200;

    let settings = SessionSettings::from_config(&config);
    assert_eq!(settings.base_delay, Duration::from_millis(50));

    let connector = WebSocketConnector::new(config.connect_timeout());
    Session::start(&config, Identity::new("u-ada", "Ada"), connector).unwrap()
}

#[tokio::test]
async fn test_full_session_flow() {
    let server = MockChatServer::start(false).await;
    let (session, mut events) = start_session(&server);

    let (tx, mut joined) = mpsc::unbounded_channel();
    session.on(MessageType::UserJoined, move |envelope| {
        let _ = tx.send(envelope.data_str("userId").map(str::to_string));
    });
    let (tx, mut echoed) = mpsc::unbounded_channel();
    session.on(MessageType::GroupMessage, move |envelope| {
        let _ = tx.send(envelope.data_str("content").map(str::to_string));
    });

    session.join_group("general").unwrap();
    session.send_group_message("general", "hello").unwrap();
    session.connect().unwrap();
    assert!(!wait_ready(&mut events).await);

    assert_eq!(joined.recv().await.unwrap().as_deref(), Some("u-ada"));
    assert_eq!(echoed.recv().await.unwrap().as_deref(), Some("hello"));

    let page = session
        .load_group_messages(LoadGroupMessages {
            group_id: "general".to_string(),
            limit: Some(10),
            before: None,
        })
        .await
        .unwrap();
    assert_eq!(page["messages"][0]["id"], "m1");

    let missing = session
        .load_group_messages(LoadGroupMessages {
            group_id: "missing".to_string(),
            limit: None,
            before: None,
        })
        .await;
    assert!(missing.is_err());

    let status = session.get_user_status("u-bob").await.unwrap();
    assert_eq!(status.status, PresenceStatus::Online);
    assert_eq!(session.requests_in_flight(), 0);

    assert_eq!(
        &server.types()[..3],
        &["join_community", "join_group", "send_group_message"]
    );

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_after_server_hang_up() {
    let server = MockChatServer::start(true).await;
    let (session, mut events) = start_session(&server);

    session.join_group("general").unwrap();
    session.connect().unwrap();

    let (lost, _) = wait_for(&mut events, |e| matches!(e, SessionEvent::ConnectionLost { .. })).await;
    assert!(matches!(lost, SessionEvent::ConnectionLost { .. }));

    let reconnected = wait_ready(&mut events).await;
    assert!(reconnected);
    assert_eq!(server.connections(), 2);

    // the second connection re-declares the group
    let (tx, mut echoed) = mpsc::unbounded_channel();
    session.on(MessageType::GroupMessage, move |envelope| {
        let _ = tx.send(envelope.group_id().map(str::to_string));
    });
    session.send_group_message("general", "after").unwrap();
    assert_eq!(echoed.recv().await.unwrap().as_deref(), Some("general"));

    let types = server.types();
    let restored: Vec<&str> = types.iter().skip(1).take(2).map(String::as_str).collect();
    assert_eq!(restored, ["join_community", "join_group"]);

    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_exhausts_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = SessionConfig::default();
    config.server.url = format!("ws://{}/ws", addr);
    config.reconnect.base_delay_ms = 20;
    config.reconnect.cap_delay_ms = 40;
    config.reconnect.max_attempts = 3;

    let connector = WebSocketConnector::new(Duration::from_secs(2));
    let (session, mut events) =
        Session::start(&config, Identity::new("u-ada", "Ada"), connector).unwrap();
    session.send_group_message("general", "kept").unwrap();
    session.connect().unwrap();

    let (exhausted, _) =
        wait_for(&mut events, |e| matches!(e, SessionEvent::ReconnectExhausted { .. })).await;
    assert_eq!(exhausted, SessionEvent::ReconnectExhausted { attempts: 3 });
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.pending_len(), 1);
}
