//! One live websocket connection bridged to the [`Hub`].
//!
//! ```text
//!              ┌──────────────── Session ────────────────┐
//!  socket ───► │ inbound pump ── cursor ──► Hub::update_presence
//!  (read)      │   │ ping ──► reply queue ─┐              │
//!              │   └ other ──► FrameHandler│              │
//!              │                           ▼              │
//!  socket ◄─── │ outbound pump ◄── mailbox ◄── Hub fan-out │
//!  (write)     │   └ liveness probe every ping_period     │
//!              └──────────────────────────────────────────┘
//! ```
//!
//! The two pumps never share the socket: the stream is split and each half
//! is owned by exactly one task. Whichever pump stops first cancels the
//! shared token, the other follows, and the inbound pump always finishes by
//! unregistering from the hub.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hub::Hub;
use crate::message::{ControlFrame, Inbound, Message, MessageType};
use crate::presence::Identity;

/// Receiving end of a session's bounded outbound queue.
pub type Mailbox = mpsc::Receiver<Arc<Message>>;

/// Unique id of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Everything the hub needs to find a session again.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub session_id: SessionId,
    pub workspace_id: String,
    pub user_id: String,
}

/// The hub's side of a session.
///
/// Holds the only sender of the session's mailbox: when the hub drops the
/// handle the mailbox closes and the outbound pump shuts the socket.
#[derive(Debug)]
pub struct SessionHandle {
    key: SessionKey,
    identity: Identity,
    mailbox: mpsc::Sender<Arc<Message>>,
}

impl SessionHandle {
    /// Create a handle and its mailbox for a connection to `workspace_id`.
    pub fn channel(
        workspace_id: impl Into<String>,
        identity: Identity,
        capacity: usize,
    ) -> (Self, Mailbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let key = SessionKey {
            session_id: SessionId::new(),
            workspace_id: workspace_id.into(),
            user_id: identity.user_id.clone(),
        };
        let handle = Self {
            key,
            identity,
            mailbox: tx,
        };
        (handle, rx)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Non-blocking push into the mailbox. `false` means full or closed.
    pub(crate) fn try_deliver(&self, message: &Arc<Message>) -> bool {
        self.mailbox.try_send(Arc::clone(message)).is_ok()
    }
}

/// Per-connection timing and buffer limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound mailbox capacity; a full mailbox evicts the session
    pub mailbox_capacity: usize,
    /// Capacity of the direct reply queue (pong replies)
    pub reply_capacity: usize,
    /// Largest accepted inbound frame/message in bytes
    pub max_frame_size: usize,
    /// Deadline for a single socket write
    pub write_timeout: Duration,
    /// Read-idle deadline, extended only by probe replies
    pub pong_wait: Duration,
    /// Liveness probe period, must be shorter than `pong_wait`
    pub ping_period: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            mailbox_capacity: 256,
            reply_capacity: 16,
            max_frame_size: 8 * 1024,
            write_timeout: Duration::from_secs(10),
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

impl SessionConfig {
    /// Socket limits applied during the websocket handshake.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_frame_size(Some(self.max_frame_size))
            .max_message_size(Some(self.max_frame_size))
    }
}

/// Receives well-formed client frames whose type this core does not handle.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, session: &SessionKey, frame: ControlFrame);
}

/// Default [`FrameHandler`]: log and drop.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreFrames;

impl FrameHandler for IgnoreFrames {
    fn handle_frame(&self, session: &SessionKey, frame: ControlFrame) {
        log::debug!(
            "Session {}: ignoring unhandled '{}' frame",
            session.session_id,
            frame.kind
        );
    }
}

/// A connection waiting to be run.
pub struct Session {
    handle: SessionHandle,
    mailbox: Mailbox,
    hub: Hub,
    config: SessionConfig,
    handler: Arc<dyn FrameHandler>,
}

impl Session {
    pub fn new(
        workspace_id: impl Into<String>,
        identity: Identity,
        hub: Hub,
        config: SessionConfig,
        handler: Arc<dyn FrameHandler>,
    ) -> Self {
        let (handle, mailbox) =
            SessionHandle::channel(workspace_id, identity, config.mailbox_capacity);
        Self {
            handle,
            mailbox,
            hub,
            config,
            handler,
        }
    }

    pub fn key(&self) -> &SessionKey {
        self.handle.key()
    }

    /// Register with the hub and pump frames until the connection ends.
    ///
    /// Returns once both pumps have stopped and the session has been
    /// unregistered.
    pub async fn run<S>(self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Session {
            handle,
            mailbox,
            hub,
            config,
            handler,
        } = self;
        let key = handle.key().clone();
        let (sink, stream) = ws.split();
        let (reply_tx, reply_rx) = mpsc::channel(config.reply_capacity.max(1));
        let closed = CancellationToken::new();

        hub.register(handle);

        let writer = tokio::spawn(write_pump(
            sink,
            mailbox,
            reply_rx,
            closed.clone(),
            config.clone(),
            key.clone(),
        ));

        let inbound = InboundPump {
            key: key.clone(),
            hub: hub.clone(),
            handler,
            replies: reply_tx,
            pong_wait: config.pong_wait,
        };
        inbound.run(stream, &closed).await;

        hub.unregister(key.clone());
        closed.cancel();
        if let Err(e) = writer.await {
            log::error!("Session {}: outbound pump panicked: {e}", key.session_id);
        }
        log::info!(
            "Session {} ({}) left workspace {}",
            key.session_id,
            key.user_id,
            key.workspace_id
        );
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound pump
// ───────────────────────────────────────────────────────────────────

struct InboundPump {
    key: SessionKey,
    hub: Hub,
    handler: Arc<dyn FrameHandler>,
    replies: mpsc::Sender<Arc<Message>>,
    pong_wait: Duration,
}

impl InboundPump {
    async fn run<S>(&self, mut stream: SplitStream<WebSocketStream<S>>, closed: &CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut deadline = Instant::now() + self.pong_wait;
        loop {
            let next = tokio::select! {
                _ = closed.cancelled() => break,
                next = tokio::time::timeout_at(deadline, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    log::info!(
                        "Session {}: no probe reply within {:?}, closing",
                        self.key.session_id,
                        self.pong_wait
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    log::debug!("Session {}: read failed: {e}", self.key.session_id);
                    break;
                }
                Ok(Some(Ok(WsMessage::Pong(_)))) => {
                    deadline = Instant::now() + self.pong_wait;
                }
                Ok(Some(Ok(WsMessage::Text(text)))) => self.handle_text(text.as_str()),
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    log::debug!("Session {}: peer closed ({frame:?})", self.key.session_id);
                    break;
                }
                Ok(Some(Ok(WsMessage::Binary(_)))) => {
                    log::debug!("Session {}: ignoring binary frame", self.key.session_id);
                }
                // Pings are answered by tungstenite itself.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let inbound = match ControlFrame::parse(text).and_then(ControlFrame::into_inbound) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::debug!("Session {}: ignoring malformed frame: {e}", self.key.session_id);
                return;
            }
        };

        match inbound {
            Inbound::Cursor(update) => {
                self.hub
                    .update_presence(&self.key.workspace_id, &self.key.user_id, move |presence| {
                        presence.table_id = update.table_id;
                        presence.view_id = update.view_id;
                        presence.cell_ref = update.cell_ref;
                    });
            }
            Inbound::Ping => {
                let pong = Message::new(
                    MessageType::Pong,
                    self.key.workspace_id.as_str(),
                    self.key.user_id.as_str(),
                );
                if self.replies.try_send(Arc::new(pong)).is_err() {
                    log::debug!("Session {}: reply queue full, dropping pong", self.key.session_id);
                }
            }
            Inbound::Other(frame) => self.handler.handle_frame(&self.key, frame),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound pump
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("write did not complete within {0:?}")]
    Timeout(Duration),
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut mailbox: Mailbox,
    mut replies: mpsc::Receiver<Arc<Message>>,
    closed: CancellationToken,
    config: SessionConfig,
    key: SessionKey,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut probe = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => {
                send_close(&mut sink, "session closed", config.write_timeout).await;
                break;
            }
            message = mailbox.recv() => match message {
                Some(message) => encode(&message, &key),
                None => {
                    log::debug!("Session {}: mailbox closed by hub", key.session_id);
                    send_close(&mut sink, "evicted", config.write_timeout).await;
                    break;
                }
            },
            Some(reply) = replies.recv() => encode(&reply, &key),
            _ = probe.tick() => Some(WsMessage::Ping(Default::default())),
        };

        let Some(frame) = frame else { continue };
        if let Err(e) = write_frame(&mut sink, frame, config.write_timeout).await {
            log::debug!("Session {}: write failed: {e}", key.session_id);
            break;
        }
    }

    closed.cancel();
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
}

fn encode(message: &Message, key: &SessionKey) -> Option<WsMessage> {
    match message.encode() {
        Ok(json) => Some(WsMessage::text(json)),
        Err(e) => {
            log::error!("Session {}: failed to encode {}: {e}", key.session_id, message.msg_type);
            None
        }
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    frame: WsMessage,
    deadline: Duration,
) -> Result<(), WriteError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(WriteError::Timeout(deadline)),
    }
}

async fn send_close<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    reason: &'static str,
    deadline: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: Utf8Bytes::from_static(reason),
    };
    let _ = write_frame(sink, WsMessage::Close(Some(frame)), deadline).await;
}
