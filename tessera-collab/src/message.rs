//! JSON wire protocol for workspace collaboration events.
//!
//! Every server → client frame is one [`Message`] envelope:
//! ```text
//! {
//!   "type":      "record_updated",        ─ MessageType, snake_case
//!   "baseId":    "base-1",                ─ workspace scope
//!   "tableId":   "t1",        (optional)
//!   "recordId":  "r1",        (optional)
//!   "fieldId":   "f1",        (optional)
//!   "viewId":    "v1",        (optional)
//!   "userId":    "alice",                 ─ acting user
//!   "payload":   { … },       (optional)
//!   "timestamp": "2024-01-01T00:00:00Z"   ─ RFC 3339, UTC
//! }
//! ```
//! Absent optional fields are omitted, never sent as `null`.
//!
//! Client → server traffic is limited to small control frames
//! (`{type:"cursor", payload:{…}}`, `{type:"ping"}`), parsed by
//! [`ControlFrame`] and classified into [`Inbound`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::CellRef;

/// Message types carried in the `type` field of the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A user's presence changed (payload: Presence)
    Presence,
    /// Cursor control frame (client → server)
    Cursor,
    /// A user joined the workspace (payload: Presence)
    UserJoined,
    /// A user's last session left the workspace
    UserLeft,
    /// Full presence snapshot, sent only to a joining session
    PresenceList,
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    FieldCreated,
    FieldUpdated,
    FieldDeleted,
    TableCreated,
    TableUpdated,
    TableDeleted,
    ViewCreated,
    ViewUpdated,
    ViewDeleted,
    /// Application-level ping (client → server)
    Ping,
    /// Reply to an application-level ping
    Pong,
}

impl MessageType {
    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Cursor => "cursor",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::PresenceList => "presence_list",
            Self::RecordCreated => "record_created",
            Self::RecordUpdated => "record_updated",
            Self::RecordDeleted => "record_deleted",
            Self::FieldCreated => "field_created",
            Self::FieldUpdated => "field_updated",
            Self::FieldDeleted => "field_deleted",
            Self::TableCreated => "table_created",
            Self::TableUpdated => "table_updated",
            Self::TableDeleted => "table_deleted",
            Self::ViewCreated => "view_created",
            Self::ViewUpdated => "view_updated",
            Self::ViewDeleted => "view_deleted",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level wire envelope.
///
/// Built with [`Message::new`] plus the `with_*` helpers. Once handed to
/// the hub it is shared as `Arc<Message>` and never mutated again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(rename = "baseId")]
    pub workspace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a message stamped with the current UTC time.
    pub fn new(
        msg_type: MessageType,
        workspace_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            msg_type,
            workspace_id: workspace_id.into(),
            table_id: None,
            record_id: None,
            field_id: None,
            view_id: None,
            user_id: user_id.into(),
            payload: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_table(mut self, table_id: impl Into<String>) -> Self {
        self.table_id = Some(table_id.into());
        self
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_field(mut self, field_id: impl Into<String>) -> Self {
        self.field_id = Some(field_id.into());
        self
    }

    pub fn with_view(mut self, view_id: impl Into<String>) -> Self {
        self.view_id = Some(view_id.into());
        self
    }

    /// Attach an already-built JSON payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Serialize `data` into the payload.
    pub fn with_data<T: Serialize>(self, data: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(data)?;
        Ok(self.with_payload(payload))
    }

    /// Decode the payload into `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let payload = self.payload.clone().ok_or(ProtocolError::MissingPayload(self.msg_type))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of a `cursor` control frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_ref: Option<CellRef>,
}

/// A raw client → server frame: a type tag and an optional payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlFrame {
    /// Build a `cursor` frame.
    pub fn cursor(update: &CursorUpdate) -> Result<Self, ProtocolError> {
        Ok(Self {
            kind: MessageType::Cursor.as_str().to_string(),
            payload: Some(serde_json::to_value(update)?),
        })
    }

    /// Build a `ping` frame.
    pub fn ping() -> Self {
        Self {
            kind: MessageType::Ping.as_str().to_string(),
            payload: None,
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Classify the frame. Types other than `cursor` and `ping` are passed
    /// through untouched for out-of-scope handlers.
    pub fn into_inbound(self) -> Result<Inbound, ProtocolError> {
        match self.kind.as_str() {
            "cursor" => {
                let payload = self
                    .payload
                    .ok_or(ProtocolError::MissingPayload(MessageType::Cursor))?;
                Ok(Inbound::Cursor(serde_json::from_value(payload)?))
            }
            "ping" => Ok(Inbound::Ping),
            _ => Ok(Inbound::Other(self)),
        }
    }
}

/// A classified client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Cursor(CursorUpdate),
    Ping,
    Other(ControlFrame),
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} message has no payload")]
    MissingPayload(MessageType),
}
