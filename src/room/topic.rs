//! Room realization over a signaling topic.
//!
//! Participants announce themselves on the topic; an announce from an unseen
//! participant is answered with our own announce so both sides learn each
//! other. Announces are repeated every heartbeat and a participant that stays
//! silent for the peer timeout is treated as gone. Actions are routed by tag
//! and optional target id. With a room key, every signal travels sealed.

use super::{ActionReceiver, ActionSender, ActionTransport, PeerId, Room, RoomEvent, Signaling};
use crate::crypto::RoomKey;
use crate::error::RoomError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use meshsync_proto::{Sealed, Signal};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_CHANNEL_SIZE: usize = 256;
/// Actions held per tag until a handler is declared.
const MAX_UNROUTED_PER_TAG: usize = 256;

/// Parameters of one room.
#[derive(Debug, Clone)]
pub struct TopicRoomConfig {
    pub room: String,
    pub self_id: PeerId,
    pub key: Option<Arc<RoomKey>>,
    /// Announce interval.
    pub heartbeat: Duration,
    /// Silence after which a participant is considered gone.
    pub peer_timeout: Duration,
}

impl TopicRoomConfig {
    pub fn new(room: impl Into<String>, self_id: impl Into<PeerId>) -> Self {
        Self {
            room: room.into(),
            self_id: self_id.into(),
            key: None,
            heartbeat: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
        }
    }
}

/// Topic name a room is carried on.
pub fn room_topic(room: &str) -> String {
    format!("meshsync:{room}")
}

struct Inner {
    topic: String,
    self_id: PeerId,
    signaling: Arc<dyn Signaling>,
    key: Option<Arc<RoomKey>>,
    /// Participant -> last time we heard from it.
    peers: DashMap<PeerId, Instant>,
    actions: DashMap<String, mpsc::UnboundedSender<(PeerId, Bytes)>>,
    /// Actions that arrived before their tag had a handler. Guards routing
    /// so a handler declared concurrently sees them in order.
    unrouted: Mutex<HashMap<String, Vec<(PeerId, Bytes)>>>,
    events: broadcast::Sender<RoomEvent>,
    closed: CancellationToken,
}

/// A [`Room`] on top of a [`Signaling`] topic.
pub struct TopicRoom {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TopicRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRoom")
            .field("topic", &self.inner.topic)
            .field("self_id", &self.inner.self_id)
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

impl TopicRoom {
    /// Subscribe to the room topic, start the room task and announce.
    pub fn join(signaling: Arc<dyn Signaling>, config: TopicRoomConfig) -> Result<Arc<Self>, RoomError> {
        let topic = room_topic(&config.room);
        let rx = signaling.subscribe(&topic)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let inner = Arc::new(Inner {
            topic,
            self_id: config.self_id,
            signaling,
            key: config.key,
            peers: DashMap::new(),
            actions: DashMap::new(),
            unrouted: Mutex::new(HashMap::new()),
            events,
            closed: CancellationToken::new(),
        });

        let task = tokio::spawn(run(
            Arc::clone(&inner),
            rx,
            config.heartbeat,
            config.peer_timeout,
        ));
        inner.announce();

        Ok(Arc::new(Self {
            inner,
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }
}

async fn run(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<Value>,
    heartbeat: Duration,
    peer_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    let signaling_closed = inner.signaling.closed();

    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            _ = signaling_closed.cancelled() => {
                warn!(topic = %inner.topic, "Signaling connection lost");
                break;
            }
            msg = rx.recv() => match msg {
                Some(value) => inner.handle(value),
                None => {
                    debug!(topic = %inner.topic, "Signaling subscription ended");
                    break;
                }
            },
            _ = ticker.tick() => {
                inner.announce();
                inner.expire(peer_timeout);
            }
        }
    }

    inner.shutdown();
}

impl Inner {
    fn seal(&self, signal: &Signal) -> Result<Value, RoomError> {
        match &self.key {
            Some(key) => key
                .encrypt(&signal.to_vec())
                .map(|sealed| sealed.to_value())
                .map_err(|e| RoomError::Signaling(e.to_string())),
            None => Ok(signal.to_value()),
        }
    }

    fn open(&self, value: Value) -> Option<Signal> {
        match &self.key {
            Some(key) => {
                let sealed = Sealed::from_value(value).ok()?;
                let plain = key.decrypt(&sealed)?;
                Signal::from_slice(&plain).ok()
            }
            None => Signal::from_value(value).ok(),
        }
    }

    fn publish(&self, signal: &Signal) -> Result<(), RoomError> {
        if self.closed.is_cancelled() {
            return Err(RoomError::Closed);
        }
        let value = self.seal(signal)?;
        self.signaling.publish(&self.topic, value)
    }

    fn announce(&self) {
        let signal = Signal::Announce {
            from: self.self_id.clone(),
        };
        if let Err(e) = self.publish(&signal) {
            debug!(topic = %self.topic, error = %e, "Announce failed");
        }
    }

    /// Record activity from `peer`. Returns true when the peer is new.
    fn touch(&self, peer: &str) -> bool {
        let is_new = self.peers.insert(peer.to_string(), Instant::now()).is_none();
        if is_new {
            debug!(topic = %self.topic, peer = %peer, "Peer joined");
            let _ = self.events.send(RoomEvent::Join(peer.to_string()));
        }
        is_new
    }

    fn forget(&self, peer: &str) {
        if self.peers.remove(peer).is_some() {
            debug!(topic = %self.topic, peer = %peer, "Peer left");
            let _ = self.events.send(RoomEvent::Leave(peer.to_string()));
        }
    }

    fn handle(&self, value: Value) {
        let Some(signal) = self.open(value) else {
            crate::metrics::record_decode_fault("signal");
            debug!(topic = %self.topic, "Dropping undecodable signal");
            return;
        };
        if signal.sender() == self.self_id {
            return;
        }

        match &signal {
            Signal::Announce { from } => {
                if self.touch(from) {
                    self.announce();
                }
            }
            Signal::Leave { from } => self.forget(from),
            Signal::Action { from, to, tag, .. } => {
                if to.as_deref().is_some_and(|to| to != self.self_id) {
                    return;
                }
                let payload = match signal.payload() {
                    Ok(Some(payload)) => payload,
                    Ok(None) => return,
                    Err(e) => {
                        crate::metrics::record_decode_fault("signal");
                        debug!(topic = %self.topic, peer = %from, error = %e, "Dropping action with bad payload");
                        return;
                    }
                };
                if self.touch(from) {
                    self.announce();
                }
                self.route(tag, from.clone(), Bytes::from(payload));
            }
        }
    }

    fn route(&self, tag: &str, from: PeerId, payload: Bytes) {
        let mut unrouted = self.unrouted.lock();
        if let Some(tx) = self.actions.get(tag) {
            let _ = tx.send((from, payload));
            return;
        }
        let held = unrouted.entry(tag.to_string()).or_default();
        if held.len() >= MAX_UNROUTED_PER_TAG {
            debug!(topic = %self.topic, tag = %tag, "Dropping action for undeclared tag");
            return;
        }
        debug!(topic = %self.topic, tag = %tag, "Holding action until its tag is declared");
        held.push((from, payload));
    }

    /// Declare a handler for `tag`, handing it anything already held.
    fn declare(&self, tag: &str, tx: mpsc::UnboundedSender<(PeerId, Bytes)>) {
        let mut unrouted = self.unrouted.lock();
        for held in unrouted.remove(tag).unwrap_or_default() {
            let _ = tx.send(held);
        }
        self.actions.insert(tag.to_string(), tx);
    }

    fn expire(&self, timeout: Duration) {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| now.duration_since(*e.value()) >= timeout)
            .map(|e| e.key().clone())
            .collect();
        for peer in stale {
            debug!(topic = %self.topic, peer = %peer, "Peer timed out");
            self.forget(&peer);
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        let peers: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.forget(&peer);
        }
        // Dropping the senders ends every action receiver.
        self.actions.clear();
        self.unrouted.lock().clear();
    }
}

impl ActionTransport for Inner {
    fn send_action(&self, tag: &str, data: &[u8], to: Option<&str>) -> Result<(), RoomError> {
        let signal = Signal::action(self.self_id.clone(), to.map(str::to_string), tag, data);
        self.publish(&signal)
    }
}

#[async_trait]
impl Room for TopicRoom {
    fn self_id(&self) -> &str {
        &self.inner.self_id
    }

    fn make_action(&self, tag: &str) -> (ActionSender, ActionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.declare(tag, tx);
        let transport: Arc<dyn ActionTransport> = self.inner.clone();
        (ActionSender::new(tag, transport), rx)
    }

    fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.inner.events.subscribe()
    }

    fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn closed(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    async fn leave(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        let _ = self.inner.publish(&Signal::Leave {
            from: self.inner.self_id.clone(),
        });
        self.inner.signaling.unsubscribe(&self.inner.topic);
        self.inner.signaling.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.shutdown();
    }
}

impl Drop for TopicRoom {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
        if !self.inner.closed.is_cancelled() {
            self.inner.signaling.close();
            self.inner.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::MemoryBroker;

    async fn next_event(rx: &mut broadcast::Receiver<RoomEvent>) -> RoomEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for room event")
            .expect("event channel closed")
    }

    fn join(broker: &MemoryBroker, id: &str, key: Option<Arc<RoomKey>>) -> Arc<TopicRoom> {
        let mut config = TopicRoomConfig::new("notes", id);
        config.key = key;
        TopicRoom::join(Arc::new(broker.open()), config).unwrap()
    }

    #[tokio::test]
    async fn test_two_participants_discover_each_other() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let mut a_events = a.events();
        let b = join(&broker, "b", None);
        let mut b_events = b.events();

        assert_eq!(next_event(&mut a_events).await, RoomEvent::Join("b".into()));
        assert_eq!(next_event(&mut b_events).await, RoomEvent::Join("a".into()));
        assert_eq!(a.peers(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_targeted_action_reaches_only_target() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let b = join(&broker, "b", None);
        let c = join(&broker, "c", None);
        let (send_a, _rx_a) = a.make_action("doc");
        let (_send_b, mut rx_b) = b.make_action("doc");
        let (_send_c, mut rx_c) = c.make_action("doc");

        send_a.send(b"hello", Some("b")).unwrap();
        let (from, payload) = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "a");
        assert_eq!(&payload[..], b"hello");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_action_before_handler_is_delivered_once_declared() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let b = join(&broker, "b", None);
        let (_, mut marker_rx) = a.make_action("marker");
        let (send_sync, _) = b.make_action("sync");
        let (send_marker, _) = b.make_action("marker");

        send_sync.send(b"first", Some("a")).unwrap();
        send_marker.send(b"after", Some("a")).unwrap();
        // Same subscription, so "first" has been routed by now.
        tokio::time::timeout(Duration::from_secs(5), marker_rx.recv())
            .await
            .unwrap()
            .unwrap();

        let (_, mut sync_rx) = a.make_action("sync");
        let (from, payload) = sync_rx.try_recv().expect("held action not handed over");
        assert_eq!(from, "b");
        assert_eq!(&payload[..], b"first");

        send_sync.send(b"second", Some("a")).unwrap();
        let (_, payload) = tokio::time::timeout(Duration::from_secs(5), sync_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"second");
    }

    #[tokio::test]
    async fn test_encrypted_room_rejects_wrong_key() {
        let broker = MemoryBroker::new();
        let good = Arc::new(RoomKey::derive("secret", "notes").unwrap());
        let bad = Arc::new(RoomKey::derive("other", "notes").unwrap());
        let a = join(&broker, "a", Some(good.clone()));
        let b = join(&broker, "b", Some(good));
        let c = join(&broker, "c", Some(bad));
        let mut b_events = b.events();
        let (send_a, _) = a.make_action("doc");
        let (_, mut rx_b) = b.make_action("doc");
        let (_, mut rx_c) = c.make_action("doc");

        send_a.send(b"sealed", None).unwrap();
        let (_, payload) = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&payload[..], b"sealed");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx_c.try_recv().is_err());
        assert!(!c.peers().contains(&"a".to_string()));
        while let Ok(event) = b_events.try_recv() {
            assert_ne!(event, RoomEvent::Join("c".into()));
        }
    }

    #[tokio::test]
    async fn test_leave_is_observed_and_idempotent() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let mut a_events = a.events();
        let b = join(&broker, "b", None);
        assert_eq!(next_event(&mut a_events).await, RoomEvent::Join("b".into()));

        b.leave().await;
        b.leave().await;
        assert_eq!(next_event(&mut a_events).await, RoomEvent::Leave("b".into()));
        assert!(b.closed().is_cancelled());
        assert!(b.make_action("doc").0.send(b"x", None).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_expires() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let mut a_events = a.events();

        // A participant that announces once and then goes quiet.
        let ghost = broker.open();
        let _ghost_rx = ghost.subscribe(&room_topic("notes")).unwrap();
        ghost
            .publish(
                &room_topic("notes"),
                Signal::Announce { from: "ghost".into() }.to_value(),
            )
            .unwrap();

        assert_eq!(next_event(&mut a_events).await, RoomEvent::Join("ghost".into()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(next_event(&mut a_events).await, RoomEvent::Leave("ghost".into()));
    }

    #[tokio::test]
    async fn test_broker_fault_closes_room() {
        let broker = MemoryBroker::new();
        let a = join(&broker, "a", None);
        let closed = a.closed();
        broker.fail_all();
        tokio::time::timeout(Duration::from_secs(5), closed.cancelled())
            .await
            .unwrap();
    }
}
