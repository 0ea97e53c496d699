//! Integration tests for the websocket gateway and hub.
//!
//! These tests start a real gateway on a free port and connect raw
//! websocket clients, checking presence and fan-out end to end.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tessera_collab::auth::TicketStore;
use tessera_collab::hub::{Hub, HubConfig};
use tessera_collab::message::{Message, MessageType};
use tessera_collab::presence::{Identity, Presence};
use tessera_collab::server::{Gateway, ServerConfig};
use tessera_collab::session::{SessionConfig, SessionHandle};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    hub: Hub,
    tickets: Arc<TicketStore>,
}

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a gateway on a free port with alice, bob and carol as known users.
async fn start_test_server(session: SessionConfig) -> TestServer {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        hub: HubConfig::default(),
        session,
    };
    let hub = Hub::spawn(config.hub.clone());
    let tickets = Arc::new(TicketStore::default());
    for user in ["alice", "bob", "carol"] {
        tickets.grant_credential(
            format!("{user}-secret"),
            Identity::new(user, format!("{user}@example.com")),
        );
    }

    let gateway = Gateway::new(config, hub.clone(), tickets.clone());
    tokio::spawn(async move {
        gateway.run().await.unwrap();
    });
    // Give the gateway time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer { port, hub, tickets }
}

impl TestServer {
    async fn connect(&self, user: &str, workspace: &str) -> Socket {
        let ticket = self.tickets.issue(&format!("{user}-secret"), workspace).unwrap();
        let url = format!("ws://127.0.0.1:{}/ws/{workspace}?ticket={ticket}", self.port);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Connect and consume the initial presence list.
    async fn join(&self, user: &str, workspace: &str) -> (Socket, Vec<Presence>) {
        let mut ws = self.connect(user, workspace).await;
        let first = next_message(&mut ws).await;
        assert_eq!(first.msg_type, MessageType::PresenceList);
        (ws, first.payload_as().unwrap())
    }
}

async fn next_message(ws: &mut Socket) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("read error");
        if let WsMessage::Text(text) = frame {
            return Message::decode(text.as_str()).unwrap();
        }
    }
}

/// Read messages until one of type `ty` arrives.
async fn next_of_type(ws: &mut Socket, ty: MessageType) -> Message {
    loop {
        let msg = next_message(ws).await;
        if msg.msg_type == ty {
            return msg;
        }
    }
}

/// Collect whatever arrives within `window`.
async fn drain(ws: &mut Socket, window: Duration) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(Some(Ok(frame))) = timeout(window, ws.next()).await {
        if let WsMessage::Text(text) = frame {
            out.push(Message::decode(text.as_str()).unwrap());
        }
    }
    out
}

async fn rejected_status(url: String) -> u16 {
    match tokio_tungstenite::connect_async(url).await {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("Expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("Upgrade should have been rejected"),
    }
}

#[tokio::test]
async fn test_first_join_gets_presence_list() {
    let server = start_test_server(SessionConfig::default()).await;
    let (_alice, list) = server.join("alice", "base-1").await;

    assert_eq!(list.len(), 1);
    assert_eq!(list[0].user_id, "alice");
    assert!(list[0].table_id.is_none());

    server.hub.settle().await;
    assert_eq!(server.hub.active_users("base-1"), 1);
}

#[tokio::test]
async fn test_join_is_announced_to_others() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut alice, _) = server.join("alice", "base-1").await;
    let (_bob, list) = server.join("bob", "base-1").await;
    assert_eq!(list.len(), 2);

    let joined = next_of_type(&mut alice, MessageType::UserJoined).await;
    assert_eq!(joined.user_id, "bob");
    let presence: Presence = joined.payload_as().unwrap();
    assert_eq!(presence.email, "bob@example.com");

    let rest = drain(&mut alice, Duration::from_millis(200)).await;
    assert!(!rest
        .iter()
        .any(|m| m.msg_type == MessageType::UserJoined && m.user_id == "alice"));
}

#[tokio::test]
async fn test_cursor_moves_presence_for_everyone() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut alice, _) = server.join("alice", "base-1").await;
    let (mut bob, _) = server.join("bob", "base-1").await;
    let _ = next_of_type(&mut alice, MessageType::UserJoined).await;

    let cursor = r#"{"type":"cursor","payload":{"tableId":"t1","cellRef":{"recordId":"r1","fieldId":"f1"}}}"#;
    alice.send(WsMessage::text(cursor)).await.unwrap();

    let seen_by_bob = next_of_type(&mut bob, MessageType::Presence).await;
    assert_eq!(seen_by_bob.user_id, "alice");
    let presence: Presence = seen_by_bob.payload_as().unwrap();
    assert_eq!(presence.table_id.as_deref(), Some("t1"));

    // The sender hears about its own move too.
    let seen_by_alice = next_of_type(&mut alice, MessageType::Presence).await;
    assert_eq!(seen_by_alice.user_id, "alice");

    let alice_presence = server.hub.presence_of("base-1", "alice").unwrap();
    let cell = alice_presence.cell_ref.unwrap();
    assert_eq!(alice_presence.table_id.as_deref(), Some("t1"));
    assert_eq!((cell.record_id.as_str(), cell.field_id.as_str()), ("r1", "f1"));
}

#[tokio::test]
async fn test_slow_session_is_evicted() {
    let server = start_test_server(SessionConfig {
        mailbox_capacity: 2,
        ..SessionConfig::default()
    })
    .await;
    let (mut alice, _) = server.join("alice", "base-1").await;
    let (mut bob, _) = server.join("bob", "base-1").await;
    let _ = next_of_type(&mut alice, MessageType::UserJoined).await;
    server.hub.settle().await;
    assert_eq!(server.hub.active_users("base-1"), 2);

    // Only bob's mailbox receives the burst.
    for i in 0..16 {
        let msg = Message::new(MessageType::RecordUpdated, "base-1", "alice")
            .with_record(format!("r{i}"));
        server.hub.broadcast_except(msg, "alice");
    }
    server.hub.settle().await;
    assert_eq!(server.hub.active_users("base-1"), 1);

    let left = next_of_type(&mut alice, MessageType::UserLeft).await;
    assert_eq!(left.user_id, "bob");

    let mut close_code = None;
    while let Ok(Some(Ok(frame))) = timeout(Duration::from_secs(2), bob.next()).await {
        if let WsMessage::Close(frame) = frame {
            close_code = frame.map(|f| f.code);
            break;
        }
    }
    assert_eq!(close_code, Some(CloseCode::Away));
}

#[tokio::test]
async fn test_unregister_unknown_session_changes_nothing() {
    let server = start_test_server(SessionConfig::default()).await;
    let (_alice, _) = server.join("alice", "base-1").await;
    server.hub.settle().await;

    let (ghost, _mailbox) =
        SessionHandle::channel("base-1", Identity::new("ghost", "ghost@example.com"), 4);
    server.hub.unregister(ghost.key().clone());
    server.hub.settle().await;

    assert_eq!(server.hub.active_users("base-1"), 1);
    assert_eq!(server.hub.presence_list("base-1").len(), 1);
}

#[tokio::test]
async fn test_second_tab_keeps_presence() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut tab1, _) = server.join("alice", "base-1").await;
    let (_tab2, list) = server.join("alice", "base-1").await;
    assert_eq!(list.len(), 1);
    let (mut bob, _) = server.join("bob", "base-1").await;

    tab1.close(None).await.unwrap();
    let _ = drain(&mut tab1, Duration::from_millis(100)).await;
    server.hub.settle().await;

    assert_eq!(server.hub.active_users("base-1"), 2);
    assert!(server.hub.presence_of("base-1", "alice").is_some());
    let seen = drain(&mut bob, Duration::from_millis(200)).await;
    assert!(!seen.iter().any(|m| m.msg_type == MessageType::UserLeft));
}

#[tokio::test]
async fn test_last_disconnect_releases_workspace() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut alice, _) = server.join("alice", "base-1").await;
    let (mut bob, _) = server.join("bob", "base-1").await;

    bob.close(None).await.unwrap();
    let left = next_of_type(&mut alice, MessageType::UserLeft).await;
    assert_eq!(left.user_id, "bob");

    alice.close(None).await.unwrap();
    let _ = drain(&mut alice, Duration::from_millis(100)).await;
    // Give the server a moment to notice the close.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.hub.settle().await;

    assert_eq!(server.hub.active_users("base-1"), 0);
    assert!(server.hub.presence_list("base-1").is_empty());
    assert!(server.hub.workspaces().is_empty());
}

#[tokio::test]
async fn test_domain_events_reach_workspace_only() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut alice, _) = server.join("alice", "base-1").await;
    let (mut carol, _) = server.join("carol", "base-2").await;

    let msg = Message::new(MessageType::FieldCreated, "base-1", "alice")
        .with_table("t1")
        .with_field("f9")
        .with_payload(serde_json::json!({"name": "Status"}));
    assert!(server.hub.broadcast(msg));

    let received = next_of_type(&mut alice, MessageType::FieldCreated).await;
    assert_eq!(received.field_id.as_deref(), Some("f9"));
    assert_eq!(received.payload.unwrap()["name"], "Status");

    let carol_saw = drain(&mut carol, Duration::from_millis(200)).await;
    assert!(carol_saw.is_empty());
}

#[tokio::test]
async fn test_ping_gets_pong_envelope() {
    let server = start_test_server(SessionConfig::default()).await;
    let (mut alice, _) = server.join("alice", "base-1").await;

    alice.send(WsMessage::text(r#"{"type":"ping"}"#)).await.unwrap();
    let pong = next_of_type(&mut alice, MessageType::Pong).await;
    assert_eq!(pong.workspace_id, "base-1");
    assert_eq!(pong.user_id, "alice");
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let server = start_test_server(SessionConfig::default()).await;
    let base = format!("ws://127.0.0.1:{}", server.port);

    assert_eq!(rejected_status(format!("{base}/ws/base-1")).await, 401);
    assert_eq!(rejected_status(format!("{base}/ws/base-1?ticket=bogus")).await, 401);
    assert_eq!(rejected_status(format!("{base}/elsewhere")).await, 404);

    let ticket = server.tickets.issue("alice-secret", "base-2").unwrap();
    assert_eq!(
        rejected_status(format!("{base}/ws/base-1?ticket={ticket}")).await,
        401
    );

    server.hub.settle().await;
    assert!(server.hub.workspaces().is_empty());
}

#[tokio::test]
async fn test_token_query_accepted() {
    let server = start_test_server(SessionConfig::default()).await;
    let url = format!("ws://127.0.0.1:{}/ws/base-1?token=bob-secret", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let list = next_of_type(&mut ws, MessageType::PresenceList).await;
    let presence: Vec<Presence> = list.payload_as().unwrap();
    assert_eq!(presence[0].user_id, "bob");
}
