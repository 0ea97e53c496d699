//! # tessera-collab: Real-time collaboration core for Tessera workspaces
//!
//! Tracks who is looking at which workspace ("base"), keeps each user's live
//! presence (table / view / cell), and fans out presence and data-change
//! events to every connected session without letting a slow consumer hold
//! anyone else up.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  /ws/{base}?ticket  ┌─────────┐   register    ┌──────────┐
//! │ CollabClient │ ◄─────────────────► │ Gateway │ ────────────► │   Hub    │
//! │ (reconnects) │    JSON frames      └────┬────┘               │  (loop)  │
//! └──────┬───────┘                          │ Session::run       └────┬─────┘
//!        │                                  ▼                         │ try_send
//!        ▼                           ┌─────────────┐    mailbox       │
//! ┌──────────────┐                   │   Session   │ ◄────────────────┘
//! │PresenceCache │                   │ read │ write│
//! └──────────────┘                   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`message`]: JSON wire envelope and client control frames
//! - [`presence`]: Presence records and the client-side cache
//! - [`session`]: Per-connection read/write pumps
//! - [`hub`]: Membership, presence and fan-out event loop
//! - [`auth`]: Upgrade authorization and connection tickets
//! - [`server`]: Websocket gateway
//! - [`client`]: Reconnecting connection controller

pub mod message;
pub mod presence;
pub mod session;
pub mod hub;
pub mod auth;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use message::{ControlFrame, CursorUpdate, Inbound, Message, MessageType, ProtocolError};
pub use presence::{CellRef, Identity, Presence, PresenceCache};
pub use session::{FrameHandler, IgnoreFrames, Session, SessionConfig, SessionHandle, SessionKey};
pub use hub::{Hub, HubConfig, HubLoop, HubStats};
pub use auth::{AuthError, Authorizer, TicketProvider, TicketStore};
pub use server::{ConfigError, Gateway, GatewayError, ServerConfig};
pub use client::{backoff_delay, ClientConfig, ClientError, CollabClient, ConnectionState};
