//! Tally Server - the server half of the real-time sync core
//!
//! This crate keeps every connected client's local mirror consistent with
//! the server:
//!
//! - [`ConnectionRegistry`] tracks live sockets globally and per user, and
//!   delivers targeted or broadcast frames.
//! - [`SyncEngine`] streams each syncable collection (full or changed-since)
//!   to one socket, terminated by a `sync finished` marker.
//! - [`WsServer`] accepts WebSocket upgrades, resolves the session user via
//!   the [`SessionAuth`] seam, and dispatches inbound frames.
//! - [`ModelChanged`] + [`PushOnModelChange`] bridge the event bus to socket
//!   push notifications after a mutation commits.

mod auth;
mod error;
mod push;
mod registry;
mod server;
mod store;
mod sync;

pub use auth::{AnonymousAuth, AuthError, SessionAuth, StaticTokenAuth};
pub use error::ServerError;
pub use push::{ModelChanged, PushOnModelChange};
pub use registry::{Connection, ConnectionRegistry, Recipient, RegistryConfig, UserId};
pub use server::{InboundRouter, NullRouter, WsServer};
pub use store::MemoryCollection;
pub use sync::{SyncCollection, SyncEngine};
