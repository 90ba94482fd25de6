//! In-process signaling hub.
//!
//! Same semantics as the websocket relay: a publish reaches every other
//! subscriber of the topic. Used by tests and co-located setups.

use super::signaling::{Signaling, SignalingConnector};
use crate::error::RoomError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type ConnId = u64;

#[derive(Debug, Default)]
struct Hub {
    next_id: AtomicU64,
    /// topic -> subscribers
    topics: DashMap<String, Vec<(ConnId, mpsc::UnboundedSender<Value>)>>,
    /// Live connections, for fault injection.
    conns: DashMap<ConnId, CancellationToken>,
    /// Addresses that refuse connections.
    unreachable: DashMap<String, ()>,
}

/// In-process broker. Cheap to clone; clones share the hub.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Hub>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to the hub.
    pub fn open(&self) -> MemorySignaling {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed);
        let closed = CancellationToken::new();
        self.hub.conns.insert(id, closed.clone());
        MemorySignaling {
            id,
            hub: Arc::clone(&self.hub),
            closed,
        }
    }

    /// Number of subscribers currently on `topic`.
    pub fn subscribers(&self, topic: &str) -> usize {
        self.hub.topics.get(topic).map_or(0, |subs| subs.len())
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.hub.conns.len()
    }

    /// Fault every open connection, as if the broker went away.
    pub fn fail_all(&self) {
        let ids: Vec<ConnId> = self.hub.conns.iter().map(|e| *e.key()).collect();
        for id in ids {
            drop_conn(&self.hub, id);
        }
    }

    /// Make connector attempts to `url` fail (or succeed again).
    pub fn set_unreachable(&self, url: &str, unreachable: bool) {
        if unreachable {
            self.hub.unreachable.insert(url.to_string(), ());
        } else {
            self.hub.unreachable.remove(url);
        }
    }
}

#[async_trait]
impl SignalingConnector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Signaling>, RoomError> {
        if self.hub.unreachable.contains_key(url) {
            return Err(RoomError::Unreachable(url.to_string()));
        }
        Ok(Arc::new(self.open()))
    }
}

fn drop_conn(hub: &Hub, id: ConnId) {
    for mut subs in hub.topics.iter_mut() {
        subs.retain(|(conn, _)| *conn != id);
    }
    hub.topics.retain(|_, subs| !subs.is_empty());
    if let Some((_, token)) = hub.conns.remove(&id) {
        token.cancel();
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySignaling {
    id: ConnId,
    hub: Arc<Hub>,
    closed: CancellationToken,
}

impl Signaling for MemorySignaling {
    fn subscribe(&self, topic: &str) -> Result<mpsc::UnboundedReceiver<Value>, RoomError> {
        if self.closed.is_cancelled() {
            return Err(RoomError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.hub.topics.entry(topic.to_string()).or_default();
        subs.retain(|(conn, _)| *conn != self.id);
        subs.push((self.id, tx));
        Ok(rx)
    }

    fn unsubscribe(&self, topic: &str) {
        if let Some(mut subs) = self.hub.topics.get_mut(topic) {
            subs.retain(|(conn, _)| *conn != self.id);
        }
        self.hub.topics.remove_if(topic, |_, subs| subs.is_empty());
    }

    fn publish(&self, topic: &str, data: Value) -> Result<(), RoomError> {
        if self.closed.is_cancelled() {
            return Err(RoomError::Closed);
        }
        // Collect first: a receiver may publish in response while we hold the
        // shard lock.
        let targets: Vec<mpsc::UnboundedSender<Value>> = self
            .hub
            .topics
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter(|(conn, _)| *conn != self.id)
                    .map(|(_, tx)| tx.clone())
                    .collect()
            })
            .unwrap_or_default();
        for tx in targets {
            let _ = tx.send(data.clone());
        }
        Ok(())
    }

    fn close(&self) {
        drop_conn(&self.hub, self.id);
        self.closed.cancel();
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for MemorySignaling {
    fn drop(&mut self) {
        drop_conn(&self.hub, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_others_only() {
        let broker = MemoryBroker::new();
        let a = broker.open();
        let b = broker.open();
        let mut rx_a = a.subscribe("t").unwrap();
        let mut rx_b = b.subscribe("t").unwrap();

        a.publish("t", json!("hi")).unwrap();
        assert_eq!(rx_b.recv().await, Some(json!("hi")));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let a = broker.open();
        let mut rx = a.subscribe("t").unwrap();
        let closed = a.closed();
        a.close();
        assert!(closed.is_cancelled());
        assert_eq!(rx.recv().await, None);
        assert_eq!(broker.subscribers("t"), 0);
        assert!(a.publish("t", json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_fail_all_faults_connections() {
        let broker = MemoryBroker::new();
        let a = broker.open();
        let _rx = a.subscribe("t").unwrap();
        broker.fail_all();
        assert!(a.closed().is_cancelled());
        assert_eq!(broker.connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_connector() {
        let broker = MemoryBroker::new();
        broker.set_unreachable("ws://down", true);
        assert!(broker.connect("ws://down").await.is_err());
        assert!(broker.connect("ws://up").await.is_ok());
    }
}
