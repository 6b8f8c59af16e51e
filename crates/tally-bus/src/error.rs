use serde_json::Value;
use thiserror::Error;

/// Dispatch failure taxonomy.
///
/// `Validation` is handler-reported and meant to be surfaced to the
/// originating client as an `error_validation` frame; `Handler` wraps any
/// other handler failure and is propagated to the caller of `execute`
/// untouched. Event handler failures never appear here - the event bus
/// logs and swallows them per handler.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("no handler registered for \"{0}\"")]
    NoHandlerRegistered(&'static str),

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl BusError {
    /// Shorthand for a handler-reported validation failure.
    pub fn validation(message: impl Into<String>, details: Option<Value>) -> Self {
        BusError::Validation {
            message: message.into(),
            details,
        }
    }
}
