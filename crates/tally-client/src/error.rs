use thiserror::Error;

/// Client-side failure taxonomy. Transport errors trigger the reconnect
/// loop; they are never surfaced to application code as fatal.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection attempt timed out")]
    ConnectTimeout,
}
