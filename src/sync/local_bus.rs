//! In-process broadcast between co-located replicas of the same room.
//!
//! Every provider attached to the bus gets a transient sender id; a message
//! carries it so a provider never re-applies its own broadcast.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

const BUS_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub sender: Uuid,
    pub frame: Bytes,
}

/// Process-wide bus, one channel per room name.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    rooms: Arc<DashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a room's channel with a fresh sender id.
    pub fn join(&self, room: &str) -> LocalBusHandle {
        let tx = self
            .rooms
            .entry(room.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CHANNEL_SIZE).0)
            .clone();
        LocalBusHandle {
            id: Uuid::new_v4(),
            tx,
        }
    }
}

/// One provider's attachment to the bus.
#[derive(Debug, Clone)]
pub struct LocalBusHandle {
    id: Uuid,
    tx: broadcast::Sender<BusMessage>,
}

impl LocalBusHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn publish(&self, frame: Bytes) {
        let _ = self.tx.send(BusMessage {
            sender: self.id,
            frame,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Whether a message came from this handle.
    pub fn is_own(&self, msg: &BusMessage) -> bool {
        msg.sender == self.id
    }
}
