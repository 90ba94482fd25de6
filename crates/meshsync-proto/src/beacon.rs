//! LAN discovery beacon.
//!
//! Sent over UDP multicast by a device hosting the local relay:
//!
//! ```text
//! {"type":"beacon","peerInfo":{"deviceId":"...","name":"...","ip":"10.0.0.5","port":4444}}
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Identity and relay address of a hosting device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub device_id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// A discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DiscoveryMessage {
    Beacon {
        #[serde(rename = "peerInfo")]
        peer_info: PeerInfo,
    },
}

impl DiscoveryMessage {
    pub fn beacon(peer_info: PeerInfo) -> Self {
        Self::Beacon { peer_info }
    }

    pub fn peer_info(&self) -> &PeerInfo {
        match self {
            Self::Beacon { peer_info } => peer_info,
        }
    }

    /// Parse a datagram.
    pub fn from_slice(datagram: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(datagram)?)
    }

    /// Serialize to a datagram.
    pub fn to_vec(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_wire_shape() {
        let msg = DiscoveryMessage::beacon(PeerInfo {
            device_id: "aaa".into(),
            name: "laptop".into(),
            ip: "192.168.1.2".into(),
            port: 4444,
        });
        let v: serde_json::Value = serde_json::from_slice(&msg.to_vec()).unwrap();
        assert_eq!(v["type"], "beacon");
        assert_eq!(v["peerInfo"]["deviceId"], "aaa");
        assert_eq!(v["peerInfo"]["port"], 4444);
    }

    #[test]
    fn test_garbage_datagram_rejected() {
        assert!(DiscoveryMessage::from_slice(b"not json").is_err());
        assert!(DiscoveryMessage::from_slice(br#"{"type":"beacon"}"#).is_err());
    }
}
