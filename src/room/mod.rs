//! Transport rooms.
//!
//! A room is a named group channel across one transport instance. It offers
//! tagged point-to-point actions and join/leave notifications per remote
//! participant. [`TopicRoom`] realizes the contract on top of any
//! [`Signaling`] backend: a websocket relay ([`RelayClient`]) for both the
//! internet broker and the LAN relay, or the in-process [`MemoryBroker`].

mod memory;
mod relay_client;
mod signaling;
mod topic;

pub use memory::{MemoryBroker, MemorySignaling};
pub use relay_client::RelayClient;
pub use signaling::{Signaling, SignalingConnector, WsConnector};
pub use topic::{TopicRoom, TopicRoomConfig};

use crate::error::RoomError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Transport-level participant id.
pub type PeerId = String;

/// Membership change of a remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    Join(PeerId),
    Leave(PeerId),
}

/// Receives `(sender, payload)` for one action tag.
pub type ActionReceiver = mpsc::UnboundedReceiver<(PeerId, Bytes)>;

/// Transport side of an action: how a tagged payload leaves the process.
pub trait ActionTransport: Send + Sync {
    fn send_action(&self, tag: &str, data: &[u8], to: Option<&str>) -> Result<(), RoomError>;
}

/// Send half of a tagged action channel.
#[derive(Clone)]
pub struct ActionSender {
    tag: String,
    transport: Arc<dyn ActionTransport>,
}

impl ActionSender {
    pub fn new(tag: impl Into<String>, transport: Arc<dyn ActionTransport>) -> Self {
        Self {
            tag: tag.into(),
            transport,
        }
    }

    /// Send to one participant, or to everyone when `to` is `None`.
    pub fn send(&self, data: &[u8], to: Option<&str>) -> Result<(), RoomError> {
        self.transport.send_action(&self.tag, data, to)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl std::fmt::Debug for ActionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSender").field("tag", &self.tag).finish()
    }
}

/// The room contract consumed by a replication provider.
#[async_trait]
pub trait Room: Send + Sync + 'static {
    /// This participant's id within the room.
    fn self_id(&self) -> &str;

    /// Declare an action tag. Payloads for this tag that arrive after the
    /// call are delivered on the returned receiver.
    fn make_action(&self, tag: &str) -> (ActionSender, ActionReceiver);

    /// Subscribe to join/leave notifications.
    fn events(&self) -> broadcast::Receiver<RoomEvent>;

    /// Live low-level connection set.
    fn peers(&self) -> Vec<PeerId>;

    /// Cancelled once the room stops, by `leave()` or a transport fault.
    fn closed(&self) -> CancellationToken;

    /// Leave the room and force-close the underlying transport.
    async fn leave(&self);
}
