use std::time::Duration;

/// Connection manager tunables. Production values match the protocol
/// defaults; tests shrink them to milliseconds.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL, including the session token query parameter.
    pub url: String,
    /// How long a connection attempt may take before it is abandoned.
    pub connect_timeout: Duration,
    /// Interval between client-side `ping` frames.
    pub heartbeat_interval: Duration,
    /// Deadline for the server's `pong` after each `ping`. Missing it
    /// forces a disconnect-and-reconnect.
    pub pong_timeout: Duration,
    /// Lower bound of the jittered reconnect interval.
    pub reconnect_min: Duration,
    /// Upper bound of the jittered reconnect interval.
    pub reconnect_max: Duration,
    /// How long a single-use pending acknowledgment waits for its reply
    /// before it is silently discarded.
    pub ack_timeout: Duration,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_millis(7_500),
            heartbeat_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_millis(7_500),
            reconnect_min: Duration::from_millis(1_500),
            reconnect_max: Duration::from_millis(3_500),
            ack_timeout: Duration::from_secs(30),
        }
    }
}
