//! Workspace registrar: membership, presence and fan-out.
//!
//! ```text
//!  Gateway ───────┐  register / unregister / broadcast
//!  Session pumps ─┼──── one ordered queue ───┐   ┌───────────────┐
//!  Domain code ───┘                          ├──►│   HubLoop     │── try_send ──► mailboxes
//!  Session pumps ──── update_presence ───────┘   │ (single task) │
//!                       (bounded)                └───────┬───────┘
//!                                                        │ exclusive write
//!                                                        ▼
//!                                       RwLock<HubState> ◄── shared read:
//!                                                            active_users()
//!                                                            presence_list()
//! ```
//!
//! Register, unregister and broadcast share one queue, so the loop applies
//! them in the order they were submitted. Only the loop task writes
//! `HubState`. Every send into the loop and every delivery out of it is
//! non-blocking: more than `broadcast_capacity` pending broadcasts drops the
//! newest, a full mailbox evicts the session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};

use crate::message::{Message, MessageType};
use crate::presence::Presence;
use crate::session::{SessionHandle, SessionId, SessionKey};

/// Hub buffer sizes.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Pending broadcasts before new ones are dropped
    pub broadcast_capacity: usize,
    /// Pending presence updates before new ones are dropped
    pub presence_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            presence_capacity: 256,
        }
    }
}

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub evictions: u64,
    pub active_sessions: usize,
    pub active_workspaces: usize,
}

/// Mutation applied to a user's presence inside the hub loop.
pub type PresenceMutator = Box<dyn FnOnce(&mut Presence) + Send>;

enum Command {
    Register(SessionHandle),
    Unregister(SessionKey),
    Broadcast(Envelope),
    Settle(oneshot::Sender<()>),
}

struct PresenceUpdate {
    workspace_id: String,
    user_id: String,
    mutate: PresenceMutator,
}

struct Envelope {
    message: Arc<Message>,
    exclude_user: Option<String>,
}

#[derive(Default)]
struct HubState {
    /// workspace id → session id → handle
    members: HashMap<String, HashMap<SessionId, SessionHandle>>,
    /// workspace id → user id → presence
    presence: HashMap<String, HashMap<String, Presence>>,
}

#[derive(Default)]
struct AtomicHubStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    evictions: AtomicU64,
}

/// Cloneable handle to the hub.
///
/// Create one per process with [`Hub::spawn`] (or [`Hub::new`] and run the
/// returned [`HubLoop`] yourself) and pass clones to whatever accepts
/// connections or publishes domain events.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<Command>,
    presence: mpsc::Sender<PresenceUpdate>,
    /// Broadcasts sitting in `commands`, bounded by `broadcast_capacity`
    pending_broadcasts: Arc<AtomicUsize>,
    broadcast_capacity: usize,
    state: Arc<RwLock<HubState>>,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    /// Create a hub handle and the loop that serves it.
    pub fn new(config: HubConfig) -> (Self, HubLoop) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (presence_tx, presence_rx) = mpsc::channel(config.presence_capacity.max(1));
        let pending_broadcasts = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(RwLock::new(HubState::default()));
        let stats = Arc::new(AtomicHubStats::default());

        let hub = Self {
            commands: command_tx,
            presence: presence_tx,
            pending_broadcasts: pending_broadcasts.clone(),
            broadcast_capacity: config.broadcast_capacity.max(1),
            state: state.clone(),
            stats: stats.clone(),
        };
        let hub_loop = HubLoop {
            commands: command_rx,
            presence: presence_rx,
            pending_broadcasts,
            state,
            stats,
        };
        (hub, hub_loop)
    }

    /// Create a hub and spawn its loop on the current tokio runtime.
    pub fn spawn(config: HubConfig) -> Self {
        let (hub, hub_loop) = Self::new(config);
        tokio::spawn(hub_loop.run());
        hub
    }

    /// Add a session to its workspace.
    pub fn register(&self, session: SessionHandle) {
        if self.commands.send(Command::Register(session)).is_err() {
            log::warn!("Hub loop is not running, register dropped");
        }
    }

    /// Remove a session. Unknown or already-removed sessions are ignored.
    pub fn unregister(&self, key: SessionKey) {
        if self.commands.send(Command::Unregister(key)).is_err() {
            log::warn!("Hub loop is not running, unregister dropped");
        }
    }

    /// Queue `message` for every session in its workspace.
    ///
    /// Returns `false` if the broadcast buffer was full and the message was
    /// dropped.
    pub fn broadcast(&self, message: Message) -> bool {
        self.enqueue(Envelope {
            message: Arc::new(message),
            exclude_user: None,
        })
    }

    /// Like [`Hub::broadcast`] but skips every session of `user_id`.
    pub fn broadcast_except(&self, message: Message, user_id: impl Into<String>) -> bool {
        self.enqueue(Envelope {
            message: Arc::new(message),
            exclude_user: Some(user_id.into()),
        })
    }

    fn enqueue(&self, envelope: Envelope) -> bool {
        let queued = self.pending_broadcasts.fetch_add(1, Ordering::AcqRel);
        if queued >= self.broadcast_capacity {
            self.pending_broadcasts.fetch_sub(1, Ordering::AcqRel);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Broadcast buffer full, dropping {} for workspace {}",
                envelope.message.msg_type,
                envelope.message.workspace_id
            );
            return false;
        }

        if self.commands.send(Command::Broadcast(envelope)).is_err() {
            self.pending_broadcasts.fetch_sub(1, Ordering::AcqRel);
            log::warn!("Hub loop is not running, broadcast dropped");
            return false;
        }
        true
    }

    /// Queue a mutation of `user_id`'s presence in `workspace_id`.
    ///
    /// Never creates an entry: if the user has no presence when the loop
    /// gets to it, nothing happens. Returns `false` if the update was
    /// dropped because the presence buffer was full.
    pub fn update_presence<F>(&self, workspace_id: &str, user_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Presence) + Send + 'static,
    {
        let update = PresenceUpdate {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            mutate: Box::new(mutate),
        };
        match self.presence.try_send(update) {
            Ok(()) => true,
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Presence update for {user_id} in {workspace_id} dropped: {e}");
                false
            }
        }
    }

    /// Number of sessions currently registered in `workspace_id`.
    pub fn active_users(&self, workspace_id: &str) -> usize {
        self.state
            .read()
            .members
            .get(workspace_id)
            .map_or(0, HashMap::len)
    }

    /// Presence of every user in `workspace_id`, in no particular order.
    pub fn presence_list(&self, workspace_id: &str) -> Vec<Presence> {
        self.state
            .read()
            .presence
            .get(workspace_id)
            .map(|users| users.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Presence of one user, if they are in the workspace.
    pub fn presence_of(&self, workspace_id: &str, user_id: &str) -> Option<Presence> {
        self.state
            .read()
            .presence
            .get(workspace_id)
            .and_then(|users| users.get(user_id).cloned())
    }

    /// Workspaces with at least one registered session.
    pub fn workspaces(&self) -> Vec<String> {
        self.state.read().members.keys().cloned().collect()
    }

    /// Wait until everything submitted before this call has been applied.
    pub async fn settle(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Settle(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.read();
        HubStats {
            messages_delivered: self.stats.delivered.load(Ordering::Relaxed),
            messages_dropped: self.stats.dropped.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            active_sessions: state.members.values().map(HashMap::len).sum(),
            active_workspaces: state.members.len(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Event loop
// ───────────────────────────────────────────────────────────────────

/// The single task that owns all hub state mutations.
pub struct HubLoop {
    commands: mpsc::UnboundedReceiver<Command>,
    presence: mpsc::Receiver<PresenceUpdate>,
    pending_broadcasts: Arc<AtomicUsize>,
    state: Arc<RwLock<HubState>>,
    stats: Arc<AtomicHubStats>,
}

impl HubLoop {
    /// Serve commands until every [`Hub`] handle has been dropped.
    pub async fn run(mut self) {
        log::info!("Hub loop started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(update) = self.presence.recv() => self.apply_presence(update),
            }
        }
        log::info!("Hub loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register(session) => self.register(session),
            Command::Unregister(key) => self.unregister(&key),
            Command::Broadcast(envelope) => {
                self.pending_broadcasts.fetch_sub(1, Ordering::AcqRel);
                self.deliver(envelope);
            }
            Command::Settle(done) => {
                while let Ok(update) = self.presence.try_recv() {
                    self.apply_presence(update);
                }
                let _ = done.send(());
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        let key = session.key().clone();
        if key.workspace_id.is_empty() {
            log::debug!("Session {} has no workspace, not registering", key.session_id);
            return;
        }

        let now = Utc::now();
        let mut state = self.state.write();

        let users = state.presence.entry(key.workspace_id.clone()).or_default();
        let joined = users
            .entry(key.user_id.clone())
            .and_modify(|presence| presence.touch(now))
            .or_insert_with(|| Presence::new(session.identity(), now))
            .clone();
        let list: Vec<Presence> = users.values().cloned().collect();

        state
            .members
            .entry(key.workspace_id.clone())
            .or_default()
            .insert(key.session_id, session);

        log::info!(
            "Session {} ({}) joined workspace {}",
            key.session_id,
            key.user_id,
            key.workspace_id
        );

        let joined_msg = Arc::new(
            Message::new(MessageType::UserJoined, key.workspace_id.as_str(), key.user_id.as_str())
                .with_payload(serde_json::to_value(&joined).unwrap_or_default()),
        );
        let mut failed = self.fan_out(&state, &joined_msg, Some(&key.user_id));

        let list_msg = Arc::new(
            Message::new(MessageType::PresenceList, key.workspace_id.as_str(), key.user_id.as_str())
                .with_payload(serde_json::to_value(&list).unwrap_or_default()),
        );
        let delivered = state
            .members
            .get(&key.workspace_id)
            .and_then(|sessions| sessions.get(&key.session_id))
            .is_some_and(|handle| handle.try_deliver(&list_msg));
        if delivered {
            self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            failed.push(key);
        }

        self.evict(&mut state, failed);
    }

    fn unregister(&mut self, key: &SessionKey) {
        let mut state = self.state.write();
        let mut pending = VecDeque::new();
        if self.depart(&mut state, key, &mut pending) {
            log::info!(
                "Session {} ({}) unregistered from workspace {}",
                key.session_id,
                key.user_id,
                key.workspace_id
            );
        } else {
            log::debug!("Session {} already unregistered", key.session_id);
        }
        self.evict(&mut state, pending);
    }

    fn apply_presence(&mut self, update: PresenceUpdate) {
        let mut state = self.state.write();
        let Some(presence) = state
            .presence
            .get_mut(&update.workspace_id)
            .and_then(|users| users.get_mut(&update.user_id))
        else {
            log::debug!(
                "No presence for {} in {}, update ignored",
                update.user_id,
                update.workspace_id
            );
            return;
        };

        (update.mutate)(presence);
        presence.touch(Utc::now());
        let payload = serde_json::to_value(&*presence).unwrap_or_default();

        let message = Arc::new(
            Message::new(MessageType::Presence, update.workspace_id, update.user_id)
                .with_payload(payload),
        );
        let failed = self.fan_out(&state, &message, None);
        self.evict(&mut state, failed);
    }

    fn deliver(&mut self, envelope: Envelope) {
        let mut state = self.state.write();
        let failed = self.fan_out(&state, &envelope.message, envelope.exclude_user.as_deref());
        self.evict(&mut state, failed);
    }

    /// Push `message` into every mailbox of its workspace except those of
    /// `exclude_user`. Returns the sessions whose mailbox rejected it.
    fn fan_out(
        &self,
        state: &HubState,
        message: &Arc<Message>,
        exclude_user: Option<&str>,
    ) -> Vec<SessionKey> {
        let Some(sessions) = state.members.get(&message.workspace_id) else {
            return Vec::new();
        };

        let mut failed = Vec::new();
        for handle in sessions.values() {
            if exclude_user.is_some_and(|user| user == handle.key().user_id) {
                continue;
            }
            if handle.try_deliver(message) {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
            } else {
                failed.push(handle.key().clone());
            }
        }
        failed
    }

    /// Evict sessions whose mailbox is full or closed. Departures can fail
    /// further deliveries, so this works through a queue until it is empty.
    fn evict(&self, state: &mut HubState, failed: impl IntoIterator<Item = SessionKey>) {
        let mut pending: VecDeque<SessionKey> = failed.into_iter().collect();
        while let Some(key) = pending.pop_front() {
            if self.depart(state, &key, &mut pending) {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Evicted slow session {} ({}) from workspace {}",
                    key.session_id,
                    key.user_id,
                    key.workspace_id
                );
            }
        }
    }

    /// Remove one session. Drops its handle (closing the mailbox), removes
    /// the user's presence and announces `user_left` when this was their
    /// last session, and forgets the workspace once it is empty.
    ///
    /// Returns `false` if the session was not registered.
    fn depart(
        &self,
        state: &mut HubState,
        key: &SessionKey,
        pending: &mut VecDeque<SessionKey>,
    ) -> bool {
        let Some(sessions) = state.members.get_mut(&key.workspace_id) else {
            return false;
        };
        let Some(handle) = sessions.remove(&key.session_id) else {
            return false;
        };
        drop(handle);

        let user_remains = sessions
            .values()
            .any(|other| other.key().user_id == key.user_id);
        let workspace_empty = sessions.is_empty();

        if !user_remains {
            if let Some(users) = state.presence.get_mut(&key.workspace_id) {
                users.remove(&key.user_id);
            }
            let left = Arc::new(Message::new(
                MessageType::UserLeft,
                key.workspace_id.as_str(),
                key.user_id.as_str(),
            ));
            pending.extend(self.fan_out(state, &left, None));
        }

        if workspace_empty {
            state.members.remove(&key.workspace_id);
            state.presence.remove(&key.workspace_id);
            log::debug!("Workspace {} is empty, state released", key.workspace_id);
        }
        true
    }
}
