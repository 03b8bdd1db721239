//! Binary wire protocol between `SyncClient` and `SyncServer`.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`WireMessage`].
//!
//! ```text
//! client                                   server
//!   │ ── Request { id, Subscribe } ────────► │
//!   │ ◄──────── Response { id, Subscribed } ─ │
//!   │ ◄──────────────── Change { sub, .. } ── │  (until Unsubscribe)
//!   │ ── Request { id, PresenceOpen } ─────► │
//!   │ ◄────────── Response { id, Opened } ── │
//!   │ ◄───────────── Presence { chan, .. } ── │
//! ```
//!
//! Record payloads are JSON documents with open-ended fields, which bincode
//! cannot describe, so they travel as JSON text inside the binary frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use range_core::{ChangeKind, ChangeNotification, PresenceRecord};

use crate::backend::{BackendError, QueryOptions, SubscriptionId};
use crate::presence::PresenceEvent;

/// Client to server calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Query { table: String, options: QueryOptions },
    Insert { table: String, payload: String },
    Patch { table: String, id: String, partial: String },
    Delete { table: String, id: String },
    Subscribe { table: String },
    Unsubscribe { subscription_id: u64 },
    PresenceOpen { panel_id: String },
    PresenceTrack { channel_id: u64, record: PresenceRecord },
    PresenceClose { channel_id: u64 },
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Rows(Vec<String>),
    Row(String),
    Done,
    Subscribed { subscription_id: u64 },
    Opened { channel_id: u64 },
}

/// A change notification with its record as JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireChange {
    pub table: String,
    pub kind: ChangeKind,
    pub id: String,
    pub record: Option<String>,
    pub sequence: u64,
}

impl WireChange {
    pub fn from_notification(notification: &ChangeNotification) -> Result<Self, ProtocolError> {
        let record = notification.record.as_ref().map(to_json).transpose()?;
        Ok(Self {
            table: notification.table.clone(),
            kind: notification.kind,
            id: notification.id.clone(),
            record,
            sequence: notification.sequence,
        })
    }

    pub fn into_notification(self) -> Result<ChangeNotification, ProtocolError> {
        let record = self.record.as_deref().map(from_json).transpose()?;
        Ok(ChangeNotification {
            table: self.table,
            kind: self.kind,
            id: self.id,
            record,
            sequence: self.sequence,
        })
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    Request { request_id: u64, request: Request },
    Response { request_id: u64, result: Result<Reply, BackendError> },
    Change { subscription_id: u64, change: WireChange },
    /// The server-side feed fell behind and dropped `skipped` notifications.
    Lagged { subscription_id: u64, skipped: u64 },
    /// The server-side feed ended; the client should resubscribe.
    StreamClosed { subscription_id: u64 },
    Presence { channel_id: u64, event: PresenceEvent },
    Ping,
    Pong,
}

impl WireMessage {
    pub fn request(request_id: u64, request: Request) -> Self {
        Self::Request { request_id, request }
    }

    pub fn response(request_id: u64, result: Result<Reply, BackendError>) -> Self {
        Self::Response { request_id, result }
    }

    pub fn change(id: SubscriptionId, notification: &ChangeNotification) -> Result<Self, ProtocolError> {
        Ok(Self::Change {
            subscription_id: id.0,
            change: WireChange::from_notification(notification)?,
        })
    }

    #[inline(always)]
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    #[inline(always)]
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// JSON text for a payload.
pub fn to_json(value: &Value) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

pub fn from_json(text: &str) -> Result<Value, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected message: {0}")]
    Unexpected(String),
}

impl From<ProtocolError> for BackendError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Serialization(msg) | ProtocolError::Deserialization(msg) => {
                BackendError::InvalidPayload(msg)
            }
            ProtocolError::Unexpected(msg) => BackendError::Transport(msg),
        }
    }
}
