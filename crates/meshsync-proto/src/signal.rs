//! Room signaling envelope.
//!
//! A room is realized on top of a relay topic. Participants exchange three
//! signals through the topic: `announce` (I am here), `leave` (I am gone) and
//! `action` (a tagged payload, optionally addressed to one participant).
//! When the room has a secret the signal is carried inside a [`Sealed`] box.

use crate::error::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A signal published to a room topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Announce {
        from: String,
    },
    Leave {
        from: String,
    },
    Action {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        tag: String,
        /// Base64-encoded payload.
        data: String,
    },
}

impl Signal {
    /// Build an action carrying raw bytes.
    pub fn action(
        from: impl Into<String>,
        to: Option<String>,
        tag: impl Into<String>,
        payload: &[u8],
    ) -> Self {
        Self::Action {
            from: from.into(),
            to,
            tag: tag.into(),
            data: STANDARD.encode(payload),
        }
    }

    /// Sender of the signal.
    pub fn sender(&self) -> &str {
        match self {
            Self::Announce { from } | Self::Leave { from } | Self::Action { from, .. } => from,
        }
    }

    /// Decode the payload of an action. Other signals have none.
    pub fn payload(&self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Action { data, .. } => Ok(Some(STANDARD.decode(data)?)),
            _ => Ok(None),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An encrypted signal: base64 nonce and base64 ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub iv: String,
    pub data: String,
}

impl Sealed {
    pub fn new(iv: &[u8], ciphertext: &[u8]) -> Self {
        Self {
            iv: STANDARD.encode(iv),
            data: STANDARD.encode(ciphertext),
        }
    }

    pub fn iv_bytes(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(&self.iv)?)
    }

    pub fn data_bytes(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(&self.data)?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_payload() {
        let sig = Signal::action("a", Some("b".into()), "doc", &[1, 2, 3]);
        let back = Signal::from_value(sig.to_value()).unwrap();
        assert_eq!(back.sender(), "a");
        assert_eq!(back.payload().unwrap(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_broadcast_action_omits_target() {
        let sig = Signal::action("a", None, "doc", b"x");
        let v = sig.to_value();
        assert!(v.get("to").is_none());
        assert_eq!(v["type"], "action");
    }

    #[test]
    fn test_announce_has_no_payload() {
        let sig = Signal::Announce { from: "a".into() };
        assert_eq!(sig.payload().unwrap(), None);
    }

    #[test]
    fn test_sealed_fields() {
        let sealed = Sealed::new(&[0u8; 12], b"cipher");
        let back = Sealed::from_value(sealed.to_value()).unwrap();
        assert_eq!(back.iv_bytes().unwrap(), vec![0u8; 12]);
        assert_eq!(back.data_bytes().unwrap(), b"cipher".to_vec());
    }
}
