//! Unified error handling for meshsync.
//!
//! One error enum per layer, each with a static `error_code()` used as a
//! metric label. Only precondition violations (for example connecting a
//! strategy that was never initialized) surface to callers as hard errors;
//! transport and decode faults are logged, counted and recovered in place.

use meshsync_proto::ProtocolError;
use thiserror::Error;

// ============================================================================
// Replication errors (document + presence)
// ============================================================================

/// Errors raised while decoding or applying replicated state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("malformed frame: {0}")]
    Frame(#[from] ProtocolError),

    #[error("document replica rejected update: {0}")]
    Replica(String),

    #[error("malformed presence delta: {0}")]
    PresenceDecode(String),

    #[error("failed to encode presence delta: {0}")]
    PresenceEncode(String),
}

impl SyncError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Frame(e) => e.error_code(),
            Self::Replica(_) => "replica",
            Self::PresenceDecode(_) => "presence_decode",
            Self::PresenceEncode(_) => "presence_encode",
        }
    }
}

impl From<meshsync_crdt::DocError> for SyncError {
    fn from(e: meshsync_crdt::DocError) -> Self {
        Self::Replica(e.to_string())
    }
}

// ============================================================================
// Room errors (transport)
// ============================================================================

/// Errors raised by a transport room or its signaling channel.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room is closed")]
    Closed,

    #[error("signaling unreachable: {0}")]
    Unreachable(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RoomError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Unreachable(_) => "unreachable",
            Self::Signaling(_) => "signaling",
            Self::WebSocket(_) => "websocket",
            Self::Io(_) => "io",
        }
    }
}

// ============================================================================
// Strategy errors
// ============================================================================

/// Errors surfaced by a connection strategy.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// `connect()` before `initialize()`.
    #[error("strategy {0} used before initialize()")]
    NotInitialized(&'static str),

    #[error("strategy {0} is disabled by configuration")]
    Disabled(&'static str),

    #[error("no address configured for strategy {0}")]
    NoAddress(&'static str),

    #[error("room error: {0}")]
    Room(#[from] RoomError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl StrategyError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "not_initialized",
            Self::Disabled(_) => "disabled",
            Self::NoAddress(_) => "no_address",
            Self::Room(e) => e.error_code(),
            Self::Crypto(_) => "crypto",
        }
    }
}

// ============================================================================
// Election errors
// ============================================================================

/// Errors raised by the LAN host election service.
#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("failed to start local relay: {0}")]
    RelayStart(String),

    #[error("discovery socket error: {0}")]
    Discovery(#[from] std::io::Error),

    #[error("lan strategy error: {0}")]
    Strategy(#[from] StrategyError),
}

impl ElectionError {
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RelayStart(_) => "relay_start",
            Self::Discovery(_) => "discovery",
            Self::Strategy(e) => e.error_code(),
        }
    }
}

// ============================================================================
// Crypto errors
// ============================================================================

/// Errors raised while deriving or using a room key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("room secret is empty")]
    EmptySecret,

    #[error("key setup failed")]
    KeySetup,

    #[error("encryption failed")]
    Seal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::Replica("x".into()).error_code(), "replica");
        assert_eq!(
            SyncError::Frame(ProtocolError::EmptyFrame).error_code(),
            "empty_frame"
        );
        assert_eq!(RoomError::Closed.error_code(), "closed");
        assert_eq!(
            StrategyError::NotInitialized("lan").error_code(),
            "not_initialized"
        );
        assert_eq!(
            StrategyError::Room(RoomError::Unreachable("x".into())).error_code(),
            "unreachable"
        );
        assert_eq!(
            ElectionError::RelayStart("bind".into()).error_code(),
            "relay_start"
        );
    }

    #[test]
    fn test_doc_error_conversion() {
        let err: SyncError = meshsync_crdt::DocError::MalformedUpdate("bad".into()).into();
        assert!(matches!(err, SyncError::Replica(_)));
    }
}
