//! Signaling backends.
//!
//! The only contract a room needs from its backend: deliver a JSON message to
//! the other participants of a named topic.

use super::RelayClient;
use crate::error::RoomError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Topic-based message delivery.
pub trait Signaling: Send + Sync + 'static {
    /// Subscribe to a topic. Messages published by *other* participants
    /// arrive on the returned receiver, which ends when the backend closes.
    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Value>, RoomError>;

    fn unsubscribe(&self, topic: &str);

    fn publish(&self, topic: &str, data: Value) -> Result<(), RoomError>;

    /// Force-close every underlying connection now.
    fn close(&self);

    /// Cancelled when the backend closes, whether by `close()` or a fault.
    fn closed(&self) -> CancellationToken;
}

/// Opens a signaling connection to an address.
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Signaling>, RoomError>;
}

/// Connector for websocket relays.
#[derive(Debug, Clone)]
pub struct WsConnector {
    pub ping_interval: std::time::Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            ping_interval: std::time::Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl SignalingConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Signaling>, RoomError> {
        let client = RelayClient::connect(url, self.ping_interval).await?;
        Ok(Arc::new(client))
    }
}
