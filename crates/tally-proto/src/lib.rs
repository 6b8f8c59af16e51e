//! Tally Proto - wire protocol for the Tally sync core
//!
//! Every frame exchanged between client and server is one JSON object with
//! short field names: `{"e": entity, "t": type, "p": payload, "id": ackId}`.
//! The envelope itself stays generic; inbound frames are decoded into a
//! typed [`Frame`] variant exactly once, immediately after receipt.

mod envelope;
mod error;
mod frame;

pub use envelope::{
    ChangeKind, Envelope, MessageType, ENTITY_CLIENT, ENTITY_SERVER, ENTITY_SYNC,
};
pub use error::ProtoError;
pub use frame::Frame;
