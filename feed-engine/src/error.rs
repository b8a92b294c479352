//! Error types for the feed engine

use thiserror::Error;

/// Feed engine errors
///
/// Payloads are owned strings so a single connection failure can be cloned
/// into every pending [`crate::websocket::MessageFuture`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Order book error: {0}")]
    OrderBookError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection timeout: {url} did not open within {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    #[error("Keepalive timeout: no pong from {url} for {elapsed_ms}ms")]
    KeepaliveTimeout { url: String, elapsed_ms: u64 },

    #[error("Connection to {url} closed by remote with code {code}")]
    RemoteClose { url: String, code: u16 },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Order book nonce for {symbol} is behind the buffered deltas after {tries} tries")]
    NonceBehind { symbol: String, tries: u32 },

    #[error("Order book for {symbol} skipped updates: expected nonce {expected}, got {first}")]
    SequenceGap { symbol: String, expected: u64, first: u64 },
}

impl StreamError {
    /// Whether the error was raised by the transport rather than by a
    /// consumer (used by registries to decide whether to drop a client).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            StreamError::WebSocketConnection(_)
                | StreamError::WebSocketMessage(_)
                | StreamError::ConnectionTimeout { .. }
                | StreamError::KeepaliveTimeout { .. }
                | StreamError::RemoteClose { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        StreamError::RestApiError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
