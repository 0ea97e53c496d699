//! Presence: who is looking at what inside a workspace.
//!
//! The hub keeps one [`Presence`] per (workspace, user) while that user has
//! at least one registered session. Clients mirror the hub's view in a
//! [`PresenceCache`] fed by `presence_list`, `user_joined`, `presence` and
//! `user_left` messages.
//!
//! ```text
//!  cursor frame ──► Hub::update_presence ──► Presence (last write wins)
//!                                               │
//!                                               ▼  "presence" broadcast
//!                                         PresenceCache::upsert (client)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Authenticated identity attached to a session by the auth subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A single grid cell: record (row) × field (column).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellRef {
    pub record_id: String,
    pub field_id: String,
}

impl CellRef {
    pub fn new(record_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            field_id: field_id.into(),
        }
    }
}

/// Live location of one user inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub user_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_ref: Option<CellRef>,
    pub joined_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Presence {
    /// Fresh presence for a user who just joined; `joined_at == updated_at`.
    pub fn new(identity: &Identity, now: DateTime<Utc>) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            email: identity.email.clone(),
            name: identity.name.clone(),
            table_id: None,
            view_id: None,
            cell_ref: None,
            joined_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`; `joined_at` is never touched after creation.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

// ───────────────────────────────────────────────────────────────────
// Client-side cache
// ───────────────────────────────────────────────────────────────────

/// Local mirror of a workspace's presence, keyed by user id.
#[derive(Debug, Default, Clone)]
pub struct PresenceCache {
    entries: HashMap<String, Presence>,
}

impl PresenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache (a `presence_list` arrived).
    pub fn replace_all(&mut self, list: Vec<Presence>) {
        self.entries = list.into_iter().map(|p| (p.user_id.clone(), p)).collect();
    }

    /// Insert or overwrite one user's entry.
    pub fn upsert(&mut self, presence: Presence) {
        self.entries.insert(presence.user_id.clone(), presence);
    }

    pub fn remove(&mut self, user_id: &str) -> Option<Presence> {
        self.entries.remove(user_id)
    }

    pub fn get(&self, user_id: &str) -> Option<&Presence> {
        self.entries.get(user_id)
    }

    /// All entries, in no particular order.
    pub fn snapshot(&self) -> Vec<Presence> {
        self.entries.values().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
