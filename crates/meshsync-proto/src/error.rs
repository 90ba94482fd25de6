//! Error types for the meshsync wire formats.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Errors raised while decoding any meshsync wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A peer frame had no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// A frame ended before a required header byte.
    #[error("truncated frame: missing {0}")]
    Truncated(&'static str),

    /// A sync frame carried a step this codec does not know.
    #[error("unknown sync step: {0}")]
    UnknownSyncStep(u8),

    /// A JSON message (relay, beacon, signal) failed to parse.
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),

    /// A base64 payload failed to decode.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl ProtocolError {
    /// Static code for metric labels.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyFrame => "empty_frame",
            Self::Truncated(_) => "truncated",
            Self::UnknownSyncStep(_) => "unknown_sync_step",
            Self::Json(_) => "json",
            Self::Base64(_) => "base64",
        }
    }
}
