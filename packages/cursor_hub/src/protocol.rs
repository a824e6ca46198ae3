//! Wire Protocol
//!
//! Every frame in both directions is a JSON object `{"action": ..., "data": ...}`.
//! Inbound frames are decoded in two steps: first the envelope, then the payload
//! shape for the envelope's action.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{HubError, HubResult};

/// Text sent back to a client whose frame could not be decoded.
pub const INVALID_FORMAT_MESSAGE: &str = "Invalid message format";

/// Identifies one live connection. Generated at upgrade time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Latest reported pointer state for one connection.
///
/// Updates replace the whole value; there is no per-field merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    #[serde(rename = "pos")]
    pub position: [f64; 2],
    #[serde(rename = "nick")]
    pub nickname: String,
}

impl CursorState {
    pub fn new(x: f64, y: f64, nickname: impl Into<String>) -> Self {
        Self {
            position: [x, y],
            nickname: nickname.into(),
        }
    }
}

/// Immutable point-in-time copy of every connection's cursor.
///
/// Cheap to clone, so one snapshot can be queued into many mailboxes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot(Arc<HashMap<ConnectionId, CursorState>>);

impl Snapshot {
    pub fn new(cursors: HashMap<ConnectionId, CursorState>) -> Self {
        Self(Arc::new(cursors))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&CursorState> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.0.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ConnectionId, &CursorState)> {
        self.0.iter()
    }
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        HashMap::deserialize(deserializer).map(Snapshot::new)
    }
}

/// Untyped envelope as it arrives on the wire.
///
/// Missing fields default to an empty action and a null payload, so
/// `{}` decodes and is then ignored as an unknown action.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    UpdatePos(CursorState),
    Echo(Value),
    /// Any action the server does not handle. Dropped by the reader.
    Unknown(String),
}

impl ClientMessage {
    /// Decode a raw frame: envelope first, then the payload for its action.
    ///
    /// Returns [`HubError::Decode`] when the frame is not an envelope and
    /// [`HubError::Validation`] when the payload does not fit the action.
    pub fn decode(frame: &[u8]) -> HubResult<Self> {
        let envelope: Envelope =
            serde_json::from_slice(frame).map_err(|e| HubError::Decode(e.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> HubResult<Self> {
        match envelope.action.as_str() {
            "update_pos" => serde_json::from_value::<CursorState>(envelope.data)
                .map(ClientMessage::UpdatePos)
                .map_err(|e| HubError::Validation {
                    action: envelope.action,
                    reason: e.to_string(),
                }),
            "echo" => Ok(ClientMessage::Echo(envelope.data)),
            _ => Ok(ClientMessage::Unknown(envelope.action)),
        }
    }
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full snapshot, sent once right after admission.
    Init(Snapshot),
    /// Full snapshot, sent on every tick.
    SyncData(Snapshot),
    Echo(Value),
    Error(String),
}

impl ServerMessage {
    pub fn invalid_format() -> Self {
        ServerMessage::Error(INVALID_FORMAT_MESSAGE.to_string())
    }

    pub fn action(&self) -> &'static str {
        match self {
            ServerMessage::Init(_) => "init",
            ServerMessage::SyncData(_) => "sync_data",
            ServerMessage::Echo(_) => "echo",
            ServerMessage::Error(_) => "error",
        }
    }

    /// Serialize into the JSON text carried by one websocket frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
