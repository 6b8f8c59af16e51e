//! Tally Client - client half of the real-time sync core
//!
//! [`ConnectionManager`] owns the socket lifecycle: connect with an attempt
//! timeout, heartbeat with a pong deadline as the sole liveness detector,
//! reconnect with jittered backoff, acknowledgment correlation, and
//! re-sync on every successful connect. Entity mirrors subscribe to the
//! manager and update themselves from the frames it rebroadcasts locally.

mod config;
mod cursor;
mod error;
mod manager;

pub use config::ClientConfig;
pub use cursor::{CursorStore, MemoryCursorStore};
pub use error::ClientError;
pub use manager::{ConnectionManager, ConnectionState};
