use thiserror::Error;

/// Errors produced while decoding wire frames.
#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("bad payload for {entity}/{kind}: {reason}")]
    Payload {
        entity: String,
        kind: String,
        reason: String,
    },
}
