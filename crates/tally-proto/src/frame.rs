//! Typed decoding of inbound envelopes.
//!
//! The envelope stays generic on the wire; each `(entity, type)` pair is
//! decoded into a [`Frame`] variant exactly once, immediately after receipt.
//! Unknown pairs land in [`Frame::Other`] so application routers can take
//! over without the transport layer guessing at payload shapes.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::envelope::{ChangeKind, Envelope, MessageType, ENTITY_SYNC};
use crate::error::ProtoError;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Heartbeat probe; answer with a pong.
    Ping,
    /// Heartbeat reply, tagged with the sender's reserved entity.
    Pong { from: String },
    /// Sync request. `since = None` means full sync.
    SyncStart { since: Option<DateTime<Utc>> },
    /// Sync completion marker carrying the new cursor.
    SyncFinished { cursor: DateTime<Utc> },
    /// Collection snapshot for one entity.
    List { entity: String, records: Vec<Value> },
    /// Entity mutation push.
    Change {
        entity: String,
        kind: ChangeKind,
        records: Vec<Value>,
    },
    /// Handler-reported validation failure.
    ErrorValidation {
        message: String,
        details: Option<Value>,
    },
    /// Application-specific frame; the caller routes the envelope itself.
    Other,
}

impl Frame {
    pub fn parse(env: &Envelope) -> Result<Frame, ProtoError> {
        match (&env.kind, env.entity.as_str()) {
            (MessageType::Ping, _) => Ok(Frame::Ping),
            (MessageType::Pong, _) => Ok(Frame::Pong {
                from: env.entity.clone(),
            }),
            (MessageType::Start, ENTITY_SYNC) => Ok(Frame::SyncStart {
                since: parse_cursor(env)?,
            }),
            (MessageType::Finished, ENTITY_SYNC) => match parse_cursor(env)? {
                Some(cursor) => Ok(Frame::SyncFinished { cursor }),
                None => Err(payload_error(env, "missing cursor")),
            },
            (MessageType::List, _) => Ok(Frame::List {
                entity: env.entity.clone(),
                records: env.payload.clone(),
            }),
            (MessageType::Created, _) => Ok(change(env, ChangeKind::Created)),
            (MessageType::Updated, _) => Ok(change(env, ChangeKind::Updated)),
            (MessageType::Deleted, _) => Ok(change(env, ChangeKind::Deleted)),
            (MessageType::ErrorValidation, _) => {
                let message = env
                    .payload
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("validation failed")
                    .to_string();
                Ok(Frame::ErrorValidation {
                    message,
                    details: env.payload.get(1).cloned(),
                })
            }
            _ => Ok(Frame::Other),
        }
    }
}

fn change(env: &Envelope, kind: ChangeKind) -> Frame {
    Frame::Change {
        entity: env.entity.clone(),
        kind,
        records: env.payload.clone(),
    }
}

/// Reads an epoch-milliseconds cursor from the first payload slot.
/// Zero or an absent payload means "no cursor" (full sync).
fn parse_cursor(env: &Envelope) -> Result<Option<DateTime<Utc>>, ProtoError> {
    let Some(raw) = env.payload.first() else {
        return Ok(None);
    };
    let millis = raw
        .as_i64()
        .ok_or_else(|| payload_error(env, "cursor is not an integer"))?;
    if millis == 0 {
        return Ok(None);
    }
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| payload_error(env, "cursor out of range"))
}

fn payload_error(env: &Envelope, reason: &str) -> ProtoError {
    ProtoError::Payload {
        entity: env.entity.clone(),
        kind: env.kind.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_heartbeat_frames() {
        assert_eq!(
            Frame::parse(&Envelope::ping("server")).unwrap(),
            Frame::Ping
        );
        assert_eq!(
            Frame::parse(&Envelope::pong("server")).unwrap(),
            Frame::Pong {
                from: "server".into()
            }
        );
    }

    #[test]
    fn test_parse_sync_start() {
        let full = Frame::parse(&Envelope::sync_start(None)).unwrap();
        assert_eq!(full, Frame::SyncStart { since: None });

        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let delta = Frame::parse(&Envelope::sync_start(Some(at))).unwrap();
        assert_eq!(delta, Frame::SyncStart { since: Some(at) });
    }

    #[test]
    fn test_parse_sync_finished_requires_cursor() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let ok = Frame::parse(&Envelope::sync_finished(at)).unwrap();
        assert_eq!(ok, Frame::SyncFinished { cursor: at });

        let bare = Envelope::new(ENTITY_SYNC, MessageType::Finished);
        assert!(Frame::parse(&bare).is_err());
    }

    #[test]
    fn test_parse_change_frames() {
        let env = Envelope::change("transaction", ChangeKind::Updated, vec![json!({"id": 7})]);
        match Frame::parse(&env).unwrap() {
            Frame::Change {
                entity,
                kind,
                records,
            } => {
                assert_eq!(entity, "transaction");
                assert_eq!(kind, ChangeKind::Updated);
                assert_eq!(records.len(), 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_pair_is_other() {
        let env = Envelope::new("budget", MessageType::Other("limit_reached".into()));
        assert_eq!(Frame::parse(&env).unwrap(), Frame::Other);

        // `start` outside the sync entity is app-specific, not a sync frame.
        let env = Envelope::new("report", MessageType::Start);
        assert_eq!(Frame::parse(&env).unwrap(), Frame::Other);
    }
}
