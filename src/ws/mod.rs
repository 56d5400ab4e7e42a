pub mod connection;
pub mod protocol;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WsError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("invalid feed config: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("heartbeat timeout - no inbound frame received")]
    HeartbeatTimeout,
    #[error("connection closed unexpectedly")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("upstream unavailable after {attempts} reconnect attempts")]
    UpstreamUnavailable { attempts: u32 },
}

impl From<serde_json::Error> for WsError {
    fn from(e: serde_json::Error) -> Self {
        WsError::Decode(e.to_string())
    }
}
