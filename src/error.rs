//! Error types for the quoting service

use thiserror::Error;

/// Failure to turn a recognized market data message into a normalized event.
///
/// Unrecognized messages are not errors; the decoder returns `Ok(None)` for them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Invalid number in `{field}`: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Service errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Snapshot fetch error: {0}")]
    SnapshotFetch(String),

    #[error("Snapshot fetch timed out after {0} ms")]
    SnapshotTimeout(u64),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Max reconnection attempts exceeded ({0})")]
    MaxReconnectAttemptsExceeded(u32),
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::SnapshotFetch(err.to_string())
    }
}

impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        MarketDataError::IpcError(err.to_string())
    }
}

impl From<prometheus::Error> for MarketDataError {
    fn from(err: prometheus::Error) -> Self {
        MarketDataError::Metrics(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
