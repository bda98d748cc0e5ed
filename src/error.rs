use thiserror::Error;

use crate::protocol::MediaKind;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling disconnected")]
    SignalingDisconnected,

    #[error("Transport establishment failed: {0}")]
    Establishment(String),

    #[error("Negotiation timed out: {0}")]
    NegotiationTimeout(String),

    #[error("Codec configuration failed [{kind}]: {reason}")]
    CodecConfiguration { kind: MediaKind, reason: String },

    #[error("Stream read error: {0}")]
    StreamRead(String),

    #[error("Datagram read error: {0}")]
    DatagramRead(String),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unknown control signal type: {0}")]
    UnknownControlType(u8),

    #[error("Platform supports neither fast path nor peer transport")]
    UnsupportedPlatform,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),
}

impl AppError {
    /// Errors that a retry or reconnect can clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::SignalingDisconnected
                | AppError::StreamRead(_)
                | AppError::DatagramRead(_)
                | AppError::MalformedEnvelope(_)
                | AppError::UnknownControlType(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
