//! Peer frame codec.
//!
//! Every message between two peer sessions is one frame on a single ordered
//! channel:
//!
//! ```text
//! [kind: u8] [sync step: u8, only when kind == SYNC] [payload ...]
//! ```
//!
//! Payloads are opaque to this crate (encoded state vectors, document updates,
//! presence deltas). Unknown kinds decode to [`Frame::Unknown`] so a session can
//! log and drop them without treating the frame as corrupt.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Document sync frame.
pub const KIND_SYNC: u8 = 0;
/// Presence delta frame.
pub const KIND_PRESENCE: u8 = 1;
/// Presence query frame (no payload).
pub const KIND_QUERY_PRESENCE: u8 = 3;

/// Sync step 1: sender's state vector.
pub const SYNC_STEP1: u8 = 0;
/// Sync step 2: diff answering a step 1.
pub const SYNC_STEP2: u8 = 1;
/// Incremental document update.
pub const SYNC_UPDATE: u8 = 2;

/// A decoded peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Request for the diff against the carried state vector.
    SyncStep1(Bytes),
    /// Diff answering a step 1; represents the sender's full state relative to us.
    SyncStep2(Bytes),
    /// Incremental update produced after the initial exchange.
    Update(Bytes),
    /// Presence delta.
    Presence(Bytes),
    /// Ask the receiver for its full presence table.
    QueryPresence,
    /// A kind this codec does not understand.
    Unknown(u8),
}

impl Frame {
    /// Encode into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.payload_len());
        match self {
            Self::SyncStep1(p) => {
                buf.put_u8(KIND_SYNC);
                buf.put_u8(SYNC_STEP1);
                buf.put_slice(p);
            }
            Self::SyncStep2(p) => {
                buf.put_u8(KIND_SYNC);
                buf.put_u8(SYNC_STEP2);
                buf.put_slice(p);
            }
            Self::Update(p) => {
                buf.put_u8(KIND_SYNC);
                buf.put_u8(SYNC_UPDATE);
                buf.put_slice(p);
            }
            Self::Presence(p) => {
                buf.put_u8(KIND_PRESENCE);
                buf.put_slice(p);
            }
            Self::QueryPresence => buf.put_u8(KIND_QUERY_PRESENCE),
            Self::Unknown(kind) => buf.put_u8(*kind),
        }
        buf.freeze()
    }

    /// Decode one frame.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let (&kind, rest) = raw.split_first().ok_or(ProtocolError::EmptyFrame)?;
        match kind {
            KIND_SYNC => {
                let (&step, payload) = rest
                    .split_first()
                    .ok_or(ProtocolError::Truncated("sync step"))?;
                let payload = Bytes::copy_from_slice(payload);
                match step {
                    SYNC_STEP1 => Ok(Self::SyncStep1(payload)),
                    SYNC_STEP2 => Ok(Self::SyncStep2(payload)),
                    SYNC_UPDATE => Ok(Self::Update(payload)),
                    other => Err(ProtocolError::UnknownSyncStep(other)),
                }
            }
            KIND_PRESENCE => Ok(Self::Presence(Bytes::copy_from_slice(rest))),
            KIND_QUERY_PRESENCE => Ok(Self::QueryPresence),
            other => Ok(Self::Unknown(other)),
        }
    }

    /// Short name for logs and metric labels.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::SyncStep1(_) => "sync_step1",
            Self::SyncStep2(_) => "sync_step2",
            Self::Update(_) => "update",
            Self::Presence(_) => "presence",
            Self::QueryPresence => "query_presence",
            Self::Unknown(_) => "unknown",
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::SyncStep1(p) | Self::SyncStep2(p) | Self::Update(p) | Self::Presence(p) => {
                p.len()
            }
            Self::QueryPresence | Self::Unknown(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_step1_layout() {
        let frame = Frame::SyncStep1(Bytes::from_static(b"sv"));
        assert_eq!(&frame.encode()[..], &[KIND_SYNC, SYNC_STEP1, b's', b'v']);
    }

    #[test]
    fn test_decode_each_kind() {
        for frame in [
            Frame::SyncStep1(Bytes::from_static(b"a")),
            Frame::SyncStep2(Bytes::from_static(b"")),
            Frame::Update(Bytes::from_static(b"xyz")),
            Frame::Presence(Bytes::from_static(b"p")),
            Frame::QueryPresence,
        ] {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        assert_eq!(Frame::decode(&[42, 1, 2]).unwrap(), Frame::Unknown(42));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::EmptyFrame)));
        assert!(matches!(
            Frame::decode(&[KIND_SYNC]),
            Err(ProtocolError::Truncated(_))
        ));
        assert!(matches!(
            Frame::decode(&[KIND_SYNC, 9]),
            Err(ProtocolError::UnknownSyncStep(9))
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(raw in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            if let Ok(frame) = Frame::decode(&raw) {
                if !matches!(frame, Frame::Unknown(_)) {
                    proptest::prop_assert_eq!(&frame.encode()[..], &raw[..]);
                }
            }
        }
    }
}
