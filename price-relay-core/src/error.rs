//! Error types for the streaming session, message decoding, configuration
//! and update submission.

use crate::types::FeedIdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Liveness timeout: no ping from peer within {0:?}")]
    LivenessTimeout(std::time::Duration),

    #[error("Not connected")]
    NotConnected,

    #[error("Session was closed")]
    Closed,

    #[error("Connection not ready after {0:?}")]
    ReadyTimeout(std::time::Duration),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Server error response: {0}")]
    ServerError(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// A single push message that could not be turned into an observation.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid feed id: {0}")]
    FeedId(#[from] FeedIdError),

    #[error("Invalid number in field `{field}`: {value}")]
    Number { field: &'static str, value: String },
}

/// Fatal startup problems. Raised before any connection is opened.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Invalid threshold for {alias}: {reason}")]
    InvalidThreshold { alias: String, reason: String },

    #[error("Invalid duration `{name}`: must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("Unknown feed id: {0}")]
    UnknownFeed(String),
}
