//! Tally Bus - typed command/query/event dispatch
//!
//! Three process-wide buses, constructed once at startup and read-only
//! thereafter:
//!
//! - [`CommandBus`]: routes a typed command to exactly one handler and
//!   returns its result or propagates its failure unchanged.
//! - [`QueryBus`]: same contract for read-only requests.
//! - [`EventBus`]: fans a typed event out to zero or more handlers, in
//!   registration order, isolating each handler's failure from the rest.
//!
//! Feature modules register their handlers during startup and then share
//! the buses behind `Arc`; the handler maps are never mutated afterwards,
//! so dispatch needs no locking.

mod command;
mod error;
mod event;
mod query;

pub use command::{Command, CommandBus, CommandHandler};
pub use error::BusError;
pub use event::{Event, EventBus, EventHandler};
pub use query::{Query, QueryBus, QueryHandler};
