use thiserror::Error;

/// Server-side failure taxonomy.
///
/// Transport errors never abort the process; they end the one connection
/// they occurred on. Store errors abort the sync stream they occurred in,
/// leaving the client's cursor untouched so the next sync retries cleanly.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}
