//! Local relay wire format.
//!
//! JSON messages over a persistent websocket:
//!
//! ```text
//! {"type":"subscribe","topics":["room"]}
//! {"type":"unsubscribe","topics":["room"]}
//! {"type":"publish","topic":"room","data":...}
//! {"type":"ping"} / {"type":"pong"}
//! ```
//!
//! A `publish` is relayed to every other subscriber of the topic; the relay
//! stamps the number of subscribers into `clients`.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message exchanged with the local relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayMessage {
    Subscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        topics: Vec<String>,
    },
    Publish {
        topic: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        clients: Option<usize>,
    },
    Ping,
    Pong,
}

impl RelayMessage {
    /// Build a publish message.
    pub fn publish(topic: impl Into<String>, data: Value) -> Self {
        Self::Publish {
            topic: topic.into(),
            data,
            clients: None,
        }
    }

    /// Parse from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        // Serialization of this enum cannot fail: all fields are JSON-native.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_shape() {
        let msg = RelayMessage::Subscribe {
            topics: vec!["room".into()],
        };
        let v: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(v, json!({"type": "subscribe", "topics": ["room"]}));
    }

    #[test]
    fn test_publish_parses_with_clients() {
        let msg = RelayMessage::from_json(
            r#"{"type":"publish","topic":"t","data":{"x":1},"clients":3}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            RelayMessage::Publish {
                topic: "t".into(),
                data: json!({"x": 1}),
                clients: Some(3),
            }
        );
    }

    #[test]
    fn test_ping_pong() {
        assert_eq!(
            RelayMessage::from_json(r#"{"type":"ping"}"#).unwrap(),
            RelayMessage::Ping
        );
        assert_eq!(RelayMessage::Pong.to_json(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(RelayMessage::from_json(r#"{"type":"shout"}"#).is_err());
    }
}
