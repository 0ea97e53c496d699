//! Connection authorization seam.
//!
//! Real deployments authenticate users elsewhere; this core only needs to
//! turn an upgrade request into an [`Identity`] (server side, [`Authorizer`])
//! and to obtain a short-lived ticket before connecting (client side,
//! [`TicketProvider`]).
//!
//! [`TicketStore`] is an in-process implementation of both:
//!
//! ```text
//!  credential ──issue──► ticket (single use, one workspace, ttl)
//!                           │
//!  GET /ws/{base}?ticket=…  └──redeem──► Identity
//!  GET /ws/{base}?token=…  ───────────► Identity (credential used directly)
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use uuid::Uuid;

use crate::presence::Identity;

/// Authorization failures. Any of them rejects the upgrade with 401.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("request carries no ticket or token")]
    MissingCredential,
    #[error("credential is not recognised")]
    UnknownCredential,
    #[error("ticket is unknown, used or expired")]
    InvalidTicket,
    #[error("ticket was issued for workspace '{expected}', not '{actual}'")]
    WorkspaceMismatch { expected: String, actual: String },
}

/// Decides who is connecting, from the workspace id and the raw query string
/// of the upgrade request.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, workspace_id: &str, query: &str) -> Result<Identity, AuthError>;
}

/// Exchanges a long-lived credential for a connection ticket.
#[async_trait]
pub trait TicketProvider: Send + Sync {
    async fn fetch_ticket(&self, workspace_id: &str, credential: &str) -> Result<String, AuthError>;
}

/// Percent-decoded value of `key` in an `a=1&b=2` query string. Values
/// that do not decode to UTF-8 count as absent.
fn query_param<'a>(query: &'a str, key: &str) -> Option<Cow<'a, str>> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, v)| *k == key && !v.is_empty())
        .and_then(|(_, v)| percent_decode_str(v).decode_utf8().ok())
}

// ───────────────────────────────────────────────────────────────────
// In-process ticket store
// ───────────────────────────────────────────────────────────────────

struct IssuedTicket {
    workspace_id: String,
    identity: Identity,
    expires_at: Instant,
}

#[derive(Default)]
struct TicketState {
    credentials: HashMap<String, Identity>,
    tickets: HashMap<String, IssuedTicket>,
}

/// Credentials and outstanding tickets, held in memory.
pub struct TicketStore {
    ttl: Duration,
    state: Mutex<TicketState>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(TicketState::default()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Accept `credential` as proof of `identity`.
    pub fn grant_credential(&self, credential: impl Into<String>, identity: Identity) {
        self.state.lock().credentials.insert(credential.into(), identity);
    }

    /// Forget a credential. Tickets already issued for it stay valid until
    /// used or expired.
    pub fn revoke_credential(&self, credential: &str) -> bool {
        self.state.lock().credentials.remove(credential).is_some()
    }

    /// Identity behind a credential.
    pub fn authenticate(&self, credential: &str) -> Result<Identity, AuthError> {
        self.state
            .lock()
            .credentials
            .get(credential)
            .cloned()
            .ok_or(AuthError::UnknownCredential)
    }

    /// Issue a single-use ticket for `workspace_id`.
    pub fn issue(&self, credential: &str, workspace_id: &str) -> Result<String, AuthError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.tickets.retain(|_, ticket| ticket.expires_at > now);

        let identity = state
            .credentials
            .get(credential)
            .cloned()
            .ok_or(AuthError::UnknownCredential)?;
        let ticket = Uuid::new_v4().to_string();
        state.tickets.insert(
            ticket.clone(),
            IssuedTicket {
                workspace_id: workspace_id.to_string(),
                identity,
                expires_at: now + self.ttl,
            },
        );
        log::debug!("Issued ticket for workspace {workspace_id}");
        Ok(ticket)
    }

    /// Consume a ticket. It is gone afterwards whether or not it was valid
    /// for this workspace.
    pub fn redeem(&self, ticket: &str, workspace_id: &str) -> Result<Identity, AuthError> {
        let issued = self
            .state
            .lock()
            .tickets
            .remove(ticket)
            .ok_or(AuthError::InvalidTicket)?;

        if Instant::now() >= issued.expires_at {
            return Err(AuthError::InvalidTicket);
        }
        if issued.workspace_id != workspace_id {
            return Err(AuthError::WorkspaceMismatch {
                expected: issued.workspace_id,
                actual: workspace_id.to_string(),
            });
        }
        Ok(issued.identity)
    }

    /// Tickets issued and not yet redeemed or purged.
    pub fn outstanding(&self) -> usize {
        self.state.lock().tickets.len()
    }
}

impl Authorizer for TicketStore {
    fn authorize(&self, workspace_id: &str, query: &str) -> Result<Identity, AuthError> {
        if let Some(ticket) = query_param(query, "ticket") {
            return self.redeem(&ticket, workspace_id);
        }
        if let Some(token) = query_param(query, "token") {
            return self.authenticate(&token);
        }
        Err(AuthError::MissingCredential)
    }
}

#[async_trait]
impl TicketProvider for TicketStore {
    async fn fetch_ticket(&self, workspace_id: &str, credential: &str) -> Result<String, AuthError> {
        self.issue(credential, workspace_id)
    }
}
