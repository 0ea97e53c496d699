//! Client-side connection controller with automatic reconnection.
//!
//! ```text
//!                 connect()
//!  Disconnected ────────────► Connecting ──open──► Connected
//!       ▲  ▲                      │                    │
//!       │  └──── fetch/open fail ─┤                    │ close
//!       │                         ▼                    ▼
//!       │              (abnormal close) ◄──────── Disconnected
//!       │                         │  code 1000 → stop
//!       │     retries left        ▼
//!       └─ none left ─── Reconnecting ──backoff──► Connecting
//! ```
//!
//! The controller also mirrors the workspace's presence into a local
//! [`PresenceCache`] and forwards every decoded server message to local
//! listeners. Outbound cursor and ping frames are sent only while
//! connected; nothing is queued across a gap.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage, Utf8Bytes};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, TicketProvider};
use crate::message::{ControlFrame, CursorUpdate, Message, MessageType};
use crate::presence::{CellRef, Presence, PresenceCache};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base websocket URL, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Reconnect attempts after an abnormal close, reset on every open
    pub max_retries: u32,
    /// First backoff delay, doubled per attempt
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Buffered messages per listener before it starts lagging
    pub listener_capacity: usize,
    /// Outbound frames waiting for the socket writer
    pub outgoing_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            listener_capacity: 256,
            outgoing_capacity: 64,
        }
    }
}

/// Delay before reconnect attempt `attempt` (zero-based): `base * 2^attempt`,
/// capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no credential set")]
    MissingCredential,
    #[error("failed to obtain ticket: {0}")]
    Ticket(#[from] AuthError),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("connection attempt was superseded")]
    Superseded,
}

struct Connection {
    outgoing: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
}

struct Control {
    workspace_id: Option<String>,
    retries_remaining: u32,
    retry_task: Option<JoinHandle<()>>,
    connection: Option<Connection>,
    /// Bumped by every connect attempt and every disconnect; callbacks from
    /// an older generation are ignored.
    generation: u64,
}

struct ClientInner {
    config: ClientConfig,
    provider: Arc<dyn TicketProvider>,
    credential: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    control: Mutex<Control>,
    presence: RwLock<PresenceCache>,
    listeners: broadcast::Sender<Arc<Message>>,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Connection state {previous:?} -> {state:?}");
        }
    }

    fn dispatch(&self, text: &str) {
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Ignoring undecodable server frame: {e}");
                return;
            }
        };

        match message.msg_type {
            MessageType::PresenceList => match message.payload_as::<Vec<Presence>>() {
                Ok(list) => self.presence.write().replace_all(list),
                Err(e) => log::debug!("Bad presence_list payload: {e}"),
            },
            MessageType::UserJoined | MessageType::Presence => {
                match message.payload_as::<Presence>() {
                    Ok(presence) => self.presence.write().upsert(presence),
                    Err(e) => log::debug!("Bad {} payload: {e}", message.msg_type),
                }
            }
            MessageType::UserLeft => {
                self.presence.write().remove(&message.user_id);
            }
            _ => {}
        }

        // No subscribers is fine.
        let _ = self.listeners.send(Arc::new(message));
    }
}

/// Connection controller for one workspace at a time.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct CollabClient {
    inner: Arc<ClientInner>,
}

impl CollabClient {
    pub fn new(config: ClientConfig, provider: Arc<dyn TicketProvider>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (listeners, _) = broadcast::channel(config.listener_capacity.max(1));
        let control = Control {
            workspace_id: None,
            retries_remaining: config.max_retries,
            retry_task: None,
            connection: None,
            generation: 0,
        };
        Self {
            inner: Arc::new(ClientInner {
                config,
                provider,
                credential: RwLock::new(None),
                state,
                control: Mutex::new(control),
                presence: RwLock::new(PresenceCache::new()),
                listeners,
            }),
        }
    }

    /// Store (or clear) the credential exchanged for tickets.
    pub fn set_credential(&self, credential: Option<String>) {
        *self.inner.credential.write() = credential;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Receive every decoded server message.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Message>> {
        self.inner.listeners.subscribe()
    }

    /// Local view of the workspace's presence.
    pub fn presence(&self) -> Vec<Presence> {
        self.inner.presence.read().snapshot()
    }

    pub fn presence_of(&self, user_id: &str) -> Option<Presence> {
        self.inner.presence.read().get(user_id).cloned()
    }

    /// Workspace currently targeted, including while reconnecting.
    pub fn workspace_id(&self) -> Option<String> {
        self.inner.control.lock().workspace_id.clone()
    }

    /// Connect to `workspace_id`, replacing any current connection.
    ///
    /// Failing to fetch a ticket or open the socket counts as an abnormal
    /// close, so a retry is scheduled while attempts remain.
    pub async fn connect(&self, workspace_id: &str) -> Result<(), ClientError> {
        self.inner.control.lock().retries_remaining = self.inner.config.max_retries;
        self.attempt(workspace_id).await
    }

    async fn attempt(&self, workspace_id: &str) -> Result<(), ClientError> {
        let credential = self.inner.credential.read().clone();
        let Some(credential) = credential else {
            // Nothing to connect with, so drop whatever we were doing.
            let mut control = self.inner.control.lock();
            self.teardown(&mut control);
            log::warn!("No credential set, not connecting to workspace {workspace_id}");
            return Err(ClientError::MissingCredential);
        };

        let generation = {
            let mut control = self.inner.control.lock();
            if let Some(task) = control.retry_task.take() {
                task.abort();
            }
            if let Some(previous) = control.connection.take() {
                previous.cancel.cancel();
            }
            control.generation += 1;
            control.workspace_id = Some(workspace_id.to_string());
            self.inner.set_state(ConnectionState::Connecting);
            control.generation
        };

        match self.open(workspace_id, &credential, generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Connecting to workspace {workspace_id} failed: {e}");
                self.handle_close(generation, None);
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        workspace_id: &str,
        credential: &str,
        generation: u64,
    ) -> Result<(), ClientError> {
        let ticket = self.inner.provider.fetch_ticket(workspace_id, credential).await?;
        let url = format!(
            "{}/ws/{}?ticket={}",
            self.inner.config.server_url.trim_end_matches('/'),
            utf8_percent_encode(workspace_id, NON_ALPHANUMERIC),
            utf8_percent_encode(&ticket, NON_ALPHANUMERIC)
        );
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (sink, stream) = ws.split();

        let (outgoing_tx, outgoing_rx) = mpsc::channel(self.inner.config.outgoing_capacity.max(1));
        let cancel = CancellationToken::new();
        {
            let mut control = self.inner.control.lock();
            if control.generation != generation {
                return Err(ClientError::Superseded);
            }
            control.retries_remaining = self.inner.config.max_retries;
            control.connection = Some(Connection {
                outgoing: outgoing_tx,
                cancel: cancel.clone(),
            });
            self.inner.set_state(ConnectionState::Connected);
        }
        log::info!("Connected to workspace {workspace_id}");

        tokio::spawn(write_loop(sink, outgoing_rx, cancel.clone()));
        tokio::spawn(self.clone().read_loop(stream, cancel, generation));
        Ok(())
    }

    async fn read_loop<S>(self, mut stream: S, cancel: CancellationToken, generation: u64)
    where
        S: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    {
        let mut close_code = None;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return,
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(WsMessage::Text(text))) => self.inner.dispatch(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    close_code = frame.map(|f| f.code);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read failed: {e}");
                    break;
                }
                None => break,
            }
        }
        cancel.cancel();
        self.handle_close(generation, close_code);
    }

    /// React to the end of connection `generation`.
    fn handle_close(&self, generation: u64, code: Option<CloseCode>) {
        let mut control = self.inner.control.lock();
        if control.generation != generation {
            return;
        }
        control.connection = None;
        self.inner.set_state(ConnectionState::Disconnected);

        if code == Some(CloseCode::Normal) {
            log::info!("Server closed the connection normally");
            return;
        }
        let Some(workspace_id) = control.workspace_id.clone() else {
            return;
        };
        if control.retries_remaining == 0 {
            log::warn!("Connection to workspace {workspace_id} lost, no retries left");
            return;
        }

        let attempt = self.inner.config.max_retries.saturating_sub(control.retries_remaining);
        control.retries_remaining -= 1;
        let delay = backoff_delay(attempt, self.inner.config.base_delay, self.inner.config.max_delay);
        log::info!(
            "Connection to workspace {workspace_id} lost ({code:?}), retrying in {delay:?} ({} left)",
            control.retries_remaining
        );
        self.inner.set_state(ConnectionState::Reconnecting);

        let client = self.clone();
        control.retry_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut control = client.inner.control.lock();
                if control.generation != generation {
                    return;
                }
                // Our own handle; dropping it detaches rather than aborts.
                control.retry_task = None;
            }
            if let Err(e) = client.attempt(&workspace_id).await {
                log::debug!("Reconnect attempt failed: {e}");
            }
        }));
    }

    /// Close intentionally: no retries, workspace and presence cleared.
    pub fn disconnect(&self) {
        let mut control = self.inner.control.lock();
        control.retries_remaining = 0;
        self.teardown(&mut control);
    }

    /// Stop the pending retry and the live connection, and forget the
    /// target workspace. Anything still in flight from before is stale.
    fn teardown(&self, control: &mut Control) {
        if let Some(task) = control.retry_task.take() {
            task.abort();
        }
        control.generation += 1;
        control.workspace_id = None;
        if let Some(connection) = control.connection.take() {
            connection.cancel.cancel();
        }
        self.inner.presence.write().clear();
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Report this user's location. Dropped (returns `false`) unless
    /// connected.
    pub fn send_cursor(
        &self,
        table_id: impl Into<String>,
        view_id: Option<String>,
        cell_ref: Option<CellRef>,
    ) -> bool {
        let update = CursorUpdate {
            table_id: Some(table_id.into()),
            view_id,
            cell_ref,
        };
        match ControlFrame::cursor(&update).and_then(|frame| frame.encode()) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                log::error!("Failed to encode cursor frame: {e}");
                false
            }
        }
    }

    /// Send an application ping; the server answers with `pong`.
    pub fn send_ping(&self) -> bool {
        match ControlFrame::ping().encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                log::error!("Failed to encode ping frame: {e}");
                false
            }
        }
    }

    fn send_text(&self, text: String) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let control = self.inner.control.lock();
        control
            .connection
            .as_ref()
            .is_some_and(|connection| connection.outgoing.try_send(WsMessage::text(text)).is_ok())
    }
}

async fn write_loop<S>(mut sink: S, mut outgoing: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("client disconnect"),
                };
                let _ = tokio::time::timeout(
                    Duration::from_secs(5),
                    sink.send(WsMessage::Close(Some(close))),
                )
                .await;
                break;
            }
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::debug!("Write failed: {e}");
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TicketStore;
    use crate::presence::Identity;
    use chrono::Utc;

    fn client_with(config: ClientConfig) -> (CollabClient, Arc<TicketStore>) {
        let store = Arc::new(TicketStore::default());
        store.grant_credential("secret-a", Identity::new("alice", "alice@example.com"));
        (CollabClient::new(config, store.clone()), store)
    }

    /// A port with nothing listening on it.
    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn presence_json(user: &str, table: Option<&str>) -> serde_json::Value {
        let mut p = Presence::new(&Identity::new(user, format!("{user}@example.com")), Utc::now());
        p.table_id = table.map(str::to_string);
        serde_json::to_value(p).unwrap()
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_sequence() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7).map(|n| backoff_delay(n, base, max).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff_delay(100, base, max), max);
    }

    #[tokio::test]
    async fn test_connect_without_credential() {
        let (client, _store) = client_with(ClientConfig::default());
        let result = client.connect("base-1").await;
        assert!(matches!(result, Err(ClientError::MissingCredential)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.workspace_id().is_none());
    }

    #[tokio::test]
    async fn test_credential_cleared_cancels_pending_retry() {
        let port = dead_port().await;
        let (client, _store) = client_with(ClientConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            base_delay: Duration::from_secs(60),
            ..ClientConfig::default()
        });
        client.set_credential(Some("secret-a".into()));
        let _ = client.connect("base-1").await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        let before = client.inner.control.lock().generation;

        client.set_credential(None);
        assert!(matches!(
            client.connect("base-2").await,
            Err(ClientError::MissingCredential)
        ));

        let control = client.inner.control.lock();
        assert!(control.retry_task.is_none());
        assert!(control.connection.is_none());
        assert!(control.workspace_id.is_none());
        assert!(control.generation > before);
        drop(control);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_dropped() {
        let (client, _store) = client_with(ClientConfig::default());
        assert!(!client.send_cursor("t1", None, None));
        assert!(!client.send_ping());
    }

    #[tokio::test]
    async fn test_failed_open_schedules_retry() {
        let port = dead_port().await;
        let (client, _store) = client_with(ClientConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            base_delay: Duration::from_secs(60),
            ..ClientConfig::default()
        });
        client.set_credential(Some("secret-a".into()));

        assert!(matches!(
            client.connect("base-1").await,
            Err(ClientError::Transport(_))
        ));
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert_eq!(client.workspace_id().as_deref(), Some("base-1"));
        assert_eq!(client.inner.control.lock().retries_remaining, 4);

        client.disconnect();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.workspace_id().is_none());
        assert!(client.inner.control.lock().retry_task.is_none());
    }

    #[tokio::test]
    async fn test_ticket_failure_counts_as_abnormal_close() {
        let (client, _store) = client_with(ClientConfig {
            base_delay: Duration::from_secs(60),
            ..ClientConfig::default()
        });
        client.set_credential(Some("revoked".into()));

        assert!(matches!(
            client.connect("base-1").await,
            Err(ClientError::Ticket(AuthError::UnknownCredential))
        ));
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        client.disconnect();
    }

    #[tokio::test]
    async fn test_retries_exhaust() {
        let port = dead_port().await;
        let (client, _store) = client_with(ClientConfig {
            server_url: format!("ws://127.0.0.1:{port}"),
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        });
        client.set_credential(Some("secret-a".into()));

        let _ = client.connect("base-1").await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        let gave_up = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let control = client.inner.control.lock();
                if control.retries_remaining == 0
                    && control.retry_task.is_none()
                    && client.state() == ConnectionState::Disconnected
                {
                    break;
                }
            }
        })
        .await;
        assert!(gave_up.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // Target is kept so a later manual connect can resume.
        assert_eq!(client.workspace_id().as_deref(), Some("base-1"));
    }

    #[test]
    fn test_dispatch_updates_presence_cache() {
        let (client, _store) = client_with(ClientConfig::default());
        let mut listener = client.subscribe();

        let list = Message::new(MessageType::PresenceList, "base-1", "alice").with_payload(
            serde_json::Value::Array(vec![presence_json("alice", None), presence_json("bob", None)]),
        );
        client.inner.dispatch(&list.encode().unwrap());
        assert_eq!(client.presence().len(), 2);

        let joined = Message::new(MessageType::UserJoined, "base-1", "carol")
            .with_payload(presence_json("carol", None));
        client.inner.dispatch(&joined.encode().unwrap());
        assert_eq!(client.presence().len(), 3);

        let moved = Message::new(MessageType::Presence, "base-1", "bob")
            .with_payload(presence_json("bob", Some("t1")));
        client.inner.dispatch(&moved.encode().unwrap());
        assert_eq!(client.presence_of("bob").unwrap().table_id.as_deref(), Some("t1"));

        let left = Message::new(MessageType::UserLeft, "base-1", "alice");
        client.inner.dispatch(&left.encode().unwrap());
        assert!(client.presence_of("alice").is_none());
        assert_eq!(client.presence().len(), 2);

        let replaced = Message::new(MessageType::PresenceList, "base-1", "dave")
            .with_payload(serde_json::Value::Array(vec![presence_json("dave", None)]));
        client.inner.dispatch(&replaced.encode().unwrap());
        assert_eq!(client.presence().len(), 1);

        // Every decoded message reaches listeners, whatever its type.
        let record = Message::new(MessageType::RecordDeleted, "base-1", "dave").with_record("r1");
        client.inner.dispatch(&record.encode().unwrap());
        let types: Vec<MessageType> = std::iter::from_fn(|| listener.try_recv().ok())
            .map(|m| m.msg_type)
            .collect();
        assert_eq!(
            types,
            vec![
                MessageType::PresenceList,
                MessageType::UserJoined,
                MessageType::Presence,
                MessageType::UserLeft,
                MessageType::PresenceList,
                MessageType::RecordDeleted,
            ]
        );
    }

    #[test]
    fn test_dispatch_ignores_garbage() {
        let (client, _store) = client_with(ClientConfig::default());
        let mut listener = client.subscribe();
        client.inner.dispatch("not json");
        client.inner.dispatch(r#"{"type":"teleport"}"#);
        assert!(listener.try_recv().is_err());
        assert!(client.presence().is_empty());
    }
}
