//! The generic message envelope shared by every frame on the wire.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::error::ProtoError;

/// Reserved entity for server heartbeat and generic notices.
pub const ENTITY_SERVER: &str = "server";
/// Reserved entity for client-originated heartbeat frames.
pub const ENTITY_CLIENT: &str = "client";
/// Reserved entity for the sync protocol.
pub const ENTITY_SYNC: &str = "sync";

/// Frame type carried in the `t` field.
///
/// The reserved values cover heartbeat, entity mirroring and the sync
/// protocol; anything else is application-specific and kept as-is in
/// [`MessageType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Ping,
    Pong,
    List,
    Created,
    Updated,
    Deleted,
    ErrorValidation,
    /// Sync stream start. Only meaningful with entity `sync`.
    Start,
    /// Sync stream completion marker. Only meaningful with entity `sync`.
    Finished,
    /// Application-specific type, passed through untouched.
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::List => "list",
            MessageType::Created => "created",
            MessageType::Updated => "updated",
            MessageType::Deleted => "deleted",
            MessageType::ErrorValidation => "error_validation",
            MessageType::Start => "start",
            MessageType::Finished => "finished",
            MessageType::Other(s) => s,
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s {
            "ping" => MessageType::Ping,
            "pong" => MessageType::Pong,
            "list" => MessageType::List,
            "created" => MessageType::Created,
            "updated" => MessageType::Updated,
            "deleted" => MessageType::Deleted,
            "error_validation" => MessageType::ErrorValidation,
            "start" => MessageType::Start,
            "finished" => MessageType::Finished,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TypeVisitor;

        impl Visitor<'_> for TypeVisitor {
            type Value = MessageType;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a message type string")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<MessageType, E> {
                Ok(MessageType::from(v))
            }
        }

        deserializer.deserialize_str(TypeVisitor)
    }
}

/// The kind of entity mutation carried by a push frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl From<ChangeKind> for MessageType {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Created => MessageType::Created,
            ChangeKind::Updated => MessageType::Updated,
            ChangeKind::Deleted => MessageType::Deleted,
        }
    }
}

/// The only structure that crosses the wire.
///
/// `entity` is the logical channel (an entity type name or one of the
/// reserved entities), `payload` is a list of opaque items whose shape is
/// agreed per `(entity, type)` pair, and `ack_id` correlates a reply to an
/// outstanding request when present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "e")]
    pub entity: String,
    #[serde(rename = "t")]
    pub kind: MessageType,
    #[serde(rename = "p", default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<Value>,
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<String>,
}

impl Envelope {
    pub fn new(entity: impl Into<String>, kind: MessageType) -> Self {
        Self {
            entity: entity.into(),
            kind,
            payload: Vec::new(),
            ack_id: None,
        }
    }

    /// Decodes one wire frame.
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Heartbeat probe stamped with the sender's reserved entity.
    pub fn ping(from: &str) -> Self {
        Self::new(from, MessageType::Ping)
    }

    /// Heartbeat reply stamped with the sender's reserved entity.
    pub fn pong(from: &str) -> Self {
        Self::new(from, MessageType::Pong)
    }

    /// Full collection snapshot (or changed-since slice) for one entity.
    pub fn list(entity: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            kind: MessageType::List,
            payload: records,
            ack_id: None,
        }
    }

    /// Entity mutation push (`created` / `updated` / `deleted`).
    pub fn change(entity: impl Into<String>, kind: ChangeKind, records: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            kind: kind.into(),
            payload: records,
            ack_id: None,
        }
    }

    /// Sync request. `since = None` asks for a full sync (`p: [0]`).
    pub fn sync_start(since: Option<DateTime<Utc>>) -> Self {
        let millis = since.map(|t| t.timestamp_millis()).unwrap_or(0);
        Self {
            entity: ENTITY_SYNC.to_string(),
            kind: MessageType::Start,
            payload: vec![json!(millis)],
            ack_id: None,
        }
    }

    /// Sync completion marker carrying the new cursor value.
    pub fn sync_finished(cursor: DateTime<Utc>) -> Self {
        Self {
            entity: ENTITY_SYNC.to_string(),
            kind: MessageType::Finished,
            payload: vec![json!(cursor.timestamp_millis())],
            ack_id: None,
        }
    }

    /// Validation failure surfaced to the originating client.
    pub fn error_validation(message: impl Into<String>, details: Option<Value>) -> Self {
        let mut payload = vec![json!(message.into())];
        if let Some(details) = details {
            payload.push(details);
        }
        Self {
            entity: ENTITY_SERVER.to_string(),
            kind: MessageType::ErrorValidation,
            payload,
            ack_id: None,
        }
    }

    /// Attaches a correlation id for request/reply matching.
    pub fn with_ack_id(mut self, ack_id: impl Into<String>) -> Self {
        self.ack_id = Some(ack_id.into());
        self
    }
}
