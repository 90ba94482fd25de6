//! Replication provider.
//!
//! Owns every [`PeerSession`] for one room. A single actor task multiplexes
//! room input (actions, join/leave), local document and presence changes, and
//! the optional in-process bus. Changes whose origin is this provider's own
//! tag are never fanned out again.

use super::local_bus::{BusMessage, LocalBus, LocalBusHandle};
use super::session::PeerSession;
use crate::origin::{Origin, ProviderTag};
use crate::presence::{ClientId, PresenceChange, PresenceTable};
use crate::replica::{DocumentChange, DocumentReplica};
use crate::room::{ActionReceiver, ActionSender, PeerId, Room, RoomEvent};
use bytes::Bytes;
use meshsync_proto::Frame;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Action tag the sync protocol runs on.
pub const SYNC_TAG: &str = "sync";

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Status(ProviderStatus),
    /// At least one session is tracked and every one is synced (or no
    /// longer is).
    Synced(bool),
    Peers {
        added: Vec<PeerId>,
        removed: Vec<PeerId>,
    },
}

#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Joins beyond this many sessions are refused.
    pub max_peers: usize,
    /// In-process path to co-located replicas.
    pub local_bus: Option<LocalBus>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            max_peers: 20,
            local_bus: None,
        }
    }
}

struct Shared {
    tag: ProviderTag,
    sender: ActionSender,
    replica: Arc<dyn DocumentReplica>,
    presence: Arc<PresenceTable>,
    sessions: Mutex<HashMap<PeerId, PeerSession>>,
    synced: AtomicBool,
    max_peers: usize,
    events: broadcast::Sender<ProviderEvent>,
    bus: Option<LocalBusHandle>,
}

impl Shared {
    fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    fn origin(&self) -> Origin {
        Origin::Provider(self.tag.clone())
    }

    /// Make sure a session exists for `peer`. False when refused at capacity.
    fn ensure_session(&self, peer: &str) -> bool {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(peer) {
                return true;
            }
            if sessions.len() >= self.max_peers {
                crate::metrics::record_join_refused();
                debug!(room = %self.tag.label(), peer = %peer, max = self.max_peers, "Refusing peer at capacity");
                return false;
            }
            let session = PeerSession::open(
                peer.to_string(),
                self.sender.clone(),
                self.tag.clone(),
                Arc::clone(&self.replica),
                Arc::clone(&self.presence),
            );
            sessions.insert(peer.to_string(), session);
        }
        crate::metrics::session_opened();
        info!(room = %self.tag.label(), peer = %peer, "Peer session opened");
        self.emit(ProviderEvent::Peers {
            added: vec![peer.to_string()],
            removed: Vec::new(),
        });
        self.update_synced();
        true
    }

    fn remove_session(&self, peer: &str) {
        let (mut session, orphaned) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.remove(peer) else {
                return;
            };
            // Clients still reachable through another session stay.
            let orphaned: Vec<ClientId> = session
                .clients()
                .iter()
                .filter(|c| !sessions.values().any(|s| s.clients().contains(*c)))
                .copied()
                .collect();
            (session, orphaned)
        };
        session.close();
        crate::metrics::session_closed();
        info!(room = %self.tag.label(), peer = %peer, "Peer session closed");

        if !orphaned.is_empty() {
            // Another transport may still reach them.
            let removed = self.presence.release(&orphaned, &self.tag);
            if removed.len() < orphaned.len() {
                debug!(room = %self.tag.label(), kept = orphaned.len() - removed.len(), "Clients still backed elsewhere");
            }
        }
        self.emit(ProviderEvent::Peers {
            added: Vec::new(),
            removed: vec![peer.to_string()],
        });
        self.update_synced();
    }

    fn receive(&self, peer: &str, data: &[u8]) {
        // A message from an unknown peer is an implicit late join.
        if !self.ensure_session(peer) {
            return;
        }
        let became_synced = self
            .sessions
            .lock()
            .get_mut(peer)
            .is_some_and(|s| s.receive(data));
        if became_synced {
            self.update_synced();
        }
    }

    fn update_synced(&self) {
        let all = {
            let sessions = self.sessions.lock();
            !sessions.is_empty() && sessions.values().all(PeerSession::is_synced)
        };
        if self.synced.swap(all, Ordering::SeqCst) != all {
            debug!(room = %self.tag.label(), synced = all, "Provider sync state changed");
            self.emit(ProviderEvent::Synced(all));
        }
    }

    fn broadcast(&self, frame: &Frame) {
        let (recipients, failures) = {
            let sessions = self.sessions.lock();
            // Per-peer failures never abort the broadcast.
            let failures = sessions.values().filter(|s| s.send(frame).is_err()).count();
            (sessions.len(), failures)
        };
        crate::metrics::record_fanout(recipients, failures);
        if let Some(bus) = &self.bus {
            bus.publish(frame.encode());
        }
    }

    fn on_document_change(&self, change: DocumentChange) {
        if change.origin.is_from(&self.tag) {
            return;
        }
        self.broadcast(&Frame::Update(change.update));
    }

    fn on_presence_change(&self, change: PresenceChange) {
        if change.is_empty() || change.origin.is_from(&self.tag) {
            return;
        }
        match self.presence.encode_update(&change.all()) {
            Ok(delta) => self.broadcast(&Frame::Presence(Bytes::from(delta))),
            Err(e) => warn!(error = %e, "Failed to encode presence delta"),
        }
    }

    fn broadcast_full_state(&self) {
        match self.replica.encode_update(None) {
            Ok(update) => self.broadcast(&Frame::Update(update)),
            Err(e) => warn!(error = %e, "Failed to encode document state"),
        }
        self.broadcast_full_presence();
    }

    fn broadcast_full_presence(&self) {
        match self.presence.encode_full() {
            Ok(delta) => self.broadcast(&Frame::Presence(Bytes::from(delta))),
            Err(e) => warn!(error = %e, "Failed to encode presence"),
        }
    }

    fn announce_on_bus(&self, bus: &LocalBusHandle) {
        if let Ok(sv) = self.replica.state_vector() {
            bus.publish(Frame::SyncStep1(sv).encode());
        }
        if let Ok(delta) = self.presence.encode_full() {
            bus.publish(Frame::Presence(Bytes::from(delta)).encode());
        }
    }

    fn on_bus_message(&self, msg: BusMessage) {
        let Some(bus) = &self.bus else {
            return;
        };
        if bus.is_own(&msg) {
            return;
        }
        let frame = match Frame::decode(&msg.frame) {
            Ok(frame) => frame,
            Err(e) => {
                crate::metrics::record_decode_fault("frame");
                debug!(error = %e, "Dropping malformed bus frame");
                return;
            }
        };
        let result = match frame {
            Frame::SyncStep1(sv) => self
                .replica
                .encode_update(Some(&sv))
                .map(|diff| bus.publish(Frame::SyncStep2(diff).encode())),
            Frame::SyncStep2(update) | Frame::Update(update) => {
                self.replica.apply_update(&update, self.origin())
            }
            Frame::Presence(delta) => self
                .presence
                .apply_update(&delta, self.origin())
                .map(|_| ()),
            Frame::QueryPresence => self
                .presence
                .encode_full()
                .map(|delta| bus.publish(Frame::Presence(Bytes::from(delta)).encode())),
            Frame::Unknown(_) => Ok(()),
        };
        if let Err(e) = result {
            crate::metrics::record_decode_fault(e.error_code());
            debug!(error = %e, "Dropping bus frame that failed to apply");
        }
    }

    fn close_all(&self) {
        let peers: Vec<PeerId> = self.sessions.lock().keys().cloned().collect();
        for peer in peers {
            self.remove_session(&peer);
        }
        self.presence.release_all(&self.tag);
    }
}

/// Replication over one room.
pub struct ReplicationProvider {
    shared: Arc<Shared>,
    room: Arc<dyn Room>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for ReplicationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationProvider")
            .field("tag", &self.shared.tag)
            .field("peers", &self.peers())
            .finish()
    }
}

impl ReplicationProvider {
    /// Attach to a joined room and start replicating.
    pub fn connect(
        room: Arc<dyn Room>,
        replica: Arc<dyn DocumentReplica>,
        presence: Arc<PresenceTable>,
        label: &str,
        options: ProviderOptions,
    ) -> Self {
        // The receive handler must exist before join/leave listeners so a
        // peer's first message cannot be lost.
        let (sender, actions) = room.make_action(SYNC_TAG);
        let room_events = room.events();
        let doc_changes = replica.subscribe();
        let presence_changes = presence.subscribe();

        let bus = options.local_bus.as_ref().map(|bus| bus.join(label));
        let bus_rx = bus.as_ref().map(LocalBusHandle::subscribe);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let shared = Arc::new(Shared {
            tag: ProviderTag::new(label),
            sender,
            replica,
            presence,
            sessions: Mutex::new(HashMap::new()),
            synced: AtomicBool::new(false),
            max_peers: options.max_peers,
            events,
            bus,
        });
        if let Some(bus) = &shared.bus {
            shared.announce_on_bus(bus);
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            Arc::clone(&shared),
            Arc::clone(&room),
            actions,
            room_events,
            doc_changes,
            presence_changes,
            bus_rx,
            cancel.clone(),
        ));

        Self {
            shared,
            room,
            cancel,
            task: Mutex::new(Some(task)),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Identity stamped on every change this provider applies.
    pub fn tag(&self) -> &ProviderTag {
        &self.shared.tag
    }

    pub fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events.subscribe()
    }

    pub fn room(&self) -> &Arc<dyn Room> {
        &self.room
    }

    /// Peers with a live session.
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared.sessions.lock().keys().cloned().collect()
    }

    /// Presence clients backed by a live session.
    pub fn session_clients(&self) -> HashSet<ClientId> {
        self.shared
            .sessions
            .lock()
            .values()
            .flat_map(|s| s.clients().iter().copied())
            .collect()
    }

    pub fn is_synced(&self) -> bool {
        self.shared.synced.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        !self.cancel.is_cancelled() && !self.room.closed().is_cancelled()
    }

    /// Open sessions for room participants that event tracking missed.
    /// Additive only.
    pub fn reconcile(&self) -> Vec<PeerId> {
        let known: HashSet<PeerId> = self.peers().into_iter().collect();
        self.room
            .peers()
            .into_iter()
            .filter(|p| !known.contains(p))
            .filter(|p| self.shared.ensure_session(p))
            .collect()
    }

    /// Close every session, stop the actor and leave the room. Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.room.leave().await;
    }
}

impl Drop for ReplicationProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    shared: Arc<Shared>,
    room: Arc<dyn Room>,
    mut actions: ActionReceiver,
    mut room_events: broadcast::Receiver<RoomEvent>,
    mut doc_changes: broadcast::Receiver<DocumentChange>,
    mut presence_changes: broadcast::Receiver<PresenceChange>,
    mut bus_rx: Option<broadcast::Receiver<BusMessage>>,
    cancel: CancellationToken,
) {
    let room_closed = room.closed();
    for peer in room.peers() {
        shared.ensure_session(&peer);
    }
    shared.emit(ProviderEvent::Status(ProviderStatus::Connected));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = room_closed.cancelled() => {
                warn!(room = %shared.tag.label(), "Room closed underneath provider");
                break;
            }
            msg = actions.recv() => match msg {
                Some((peer, data)) => shared.receive(&peer, &data),
                None => break,
            },
            event = room_events.recv() => match event {
                Ok(RoomEvent::Join(peer)) => {
                    shared.ensure_session(&peer);
                }
                Ok(RoomEvent::Leave(peer)) => shared.remove_session(&peer),
                Err(RecvError::Lagged(n)) => {
                    warn!(room = %shared.tag.label(), missed = n, "Room events lagged; resyncing membership");
                    let live: HashSet<PeerId> = room.peers().into_iter().collect();
                    let tracked: Vec<PeerId> = shared.sessions.lock().keys().cloned().collect();
                    for peer in tracked.iter().filter(|p| !live.contains(*p)) {
                        shared.remove_session(peer);
                    }
                    for peer in &live {
                        shared.ensure_session(peer);
                    }
                }
                Err(RecvError::Closed) => break,
            },
            change = doc_changes.recv() => match change {
                Ok(change) => shared.on_document_change(change),
                Err(RecvError::Lagged(n)) => {
                    warn!(room = %shared.tag.label(), missed = n, "Document changes lagged; sending full state");
                    shared.broadcast_full_state();
                }
                Err(RecvError::Closed) => break,
            },
            change = presence_changes.recv() => match change {
                Ok(change) => shared.on_presence_change(change),
                Err(RecvError::Lagged(_)) => shared.broadcast_full_presence(),
                Err(RecvError::Closed) => break,
            },
            msg = recv_bus(&mut bus_rx) => shared.on_bus_message(msg),
        }
    }

    shared.close_all();
    shared.emit(ProviderEvent::Status(ProviderStatus::Disconnected));
}

async fn recv_bus(rx: &mut Option<broadcast::Receiver<BusMessage>>) -> BusMessage {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(msg) => return msg,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::SharedDocument;
    use crate::room::{ActionTransport, MemoryBroker, TopicRoom, TopicRoomConfig};
    use crate::sync::session::tests::Recorder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Scripted room: the test injects actions and membership directly.
    struct ScriptedRoom {
        recorder: Arc<Recorder>,
        inbound: Mutex<Option<ActionReceiver>>,
        inject: mpsc::UnboundedSender<(PeerId, Bytes)>,
        events: broadcast::Sender<RoomEvent>,
        closed: CancellationToken,
        /// Low-level connection set, independent of the events sent.
        live: Mutex<Vec<PeerId>>,
    }

    impl ScriptedRoom {
        fn new() -> Arc<Self> {
            let (inject, inbound) = mpsc::unbounded_channel();
            Arc::new(Self {
                recorder: Arc::new(Recorder::default()),
                inbound: Mutex::new(Some(inbound)),
                inject,
                events: broadcast::channel(16).0,
                closed: CancellationToken::new(),
                live: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Room for ScriptedRoom {
        fn self_id(&self) -> &str {
            "me"
        }

        fn make_action(&self, tag: &str) -> (ActionSender, ActionReceiver) {
            let transport: Arc<dyn ActionTransport> = self.recorder.clone();
            let rx = self
                .inbound
                .lock()
                .take()
                .unwrap_or_else(|| mpsc::unbounded_channel().1);
            (ActionSender::new(tag, transport), rx)
        }

        fn events(&self) -> broadcast::Receiver<RoomEvent> {
            self.events.subscribe()
        }

        fn peers(&self) -> Vec<PeerId> {
            self.live.lock().clone()
        }

        fn closed(&self) -> CancellationToken {
            self.closed.clone()
        }

        async fn leave(&self) {
            self.closed.cancel();
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn scripted(max_peers: usize) -> (Arc<ScriptedRoom>, ReplicationProvider, Arc<PresenceTable>) {
        let presence = Arc::new(PresenceTable::new(1));
        let (room, provider) = scripted_on(max_peers, presence.clone());
        (room, provider, presence)
    }

    fn scripted_on(
        max_peers: usize,
        presence: Arc<PresenceTable>,
    ) -> (Arc<ScriptedRoom>, ReplicationProvider) {
        let room = ScriptedRoom::new();
        let provider = ReplicationProvider::connect(
            room.clone(),
            Arc::new(SharedDocument::new(presence.client_id())),
            presence,
            "notes",
            ProviderOptions {
                max_peers,
                local_bus: None,
            },
        );
        (room, provider)
    }

    fn presence_of(client: u64) -> Bytes {
        let remote = PresenceTable::new(client);
        remote.set_local_state(Some(json!({"name": format!("client-{client}")})));
        Frame::Presence(Bytes::from(remote.encode_full().unwrap())).encode()
    }

    #[tokio::test]
    async fn test_message_from_unknown_peer_is_implicit_join() {
        let (room, provider, _) = scripted(20);
        let mut events = provider.events();
        room.inject
            .send(("late".into(), Frame::QueryPresence.encode()))
            .unwrap();

        wait_until(|| provider.peers() == vec!["late".to_string()]).await;
        // Opening step 1 + presence, then the answer to the query.
        wait_until(|| room.recorder.sent.lock().len() == 3).await;
        let event = loop {
            match events.recv().await.unwrap() {
                ProviderEvent::Peers { added, .. } => break added,
                _ => continue,
            }
        };
        assert_eq!(event, vec!["late".to_string()]);
    }

    #[tokio::test]
    async fn test_joins_above_capacity_are_refused() {
        let (room, provider, _) = scripted(2);
        for peer in ["a", "b", "c"] {
            room.events.send(RoomEvent::Join(peer.into())).unwrap();
        }
        wait_until(|| provider.peers().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!provider.peers().contains(&"c".to_string()));

        room.inject
            .send(("d".into(), Frame::QueryPresence.encode()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.peers().len(), 2);
    }

    #[tokio::test]
    async fn test_leave_removes_session_and_its_presence() {
        let (room, provider, presence) = scripted(20);
        let remote = PresenceTable::new(7);
        remote.set_local_state(Some(json!({"name": "seven"})));
        let delta = Frame::Presence(Bytes::from(remote.encode_full().unwrap())).encode();

        room.inject.send(("peer".into(), delta)).unwrap();
        wait_until(|| presence.contains(7)).await;
        assert_eq!(provider.session_clients(), HashSet::from([7]));

        room.events.send(RoomEvent::Leave("peer".into())).unwrap();
        wait_until(|| provider.peers().is_empty()).await;
        assert!(!presence.contains(7));
    }

    #[tokio::test]
    async fn test_session_loss_keeps_clients_another_provider_backs() {
        let presence = Arc::new(PresenceTable::new(1));
        let (lan_room, lan) = scripted_on(20, presence.clone());
        let (net_room, net) = scripted_on(20, presence.clone());
        lan_room.inject.send(("peer".into(), presence_of(7))).unwrap();
        net_room.inject.send(("peer".into(), presence_of(7))).unwrap();
        wait_until(|| presence.backers(7) == 2).await;
        assert!(net.session_clients().contains(&7));

        let mut changes = presence.subscribe();
        net_room.events.send(RoomEvent::Leave("peer".into())).unwrap();
        wait_until(|| net.peers().is_empty()).await;
        assert!(presence.contains(7));
        assert_eq!(presence.backers(7), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(change) = changes.try_recv() {
            assert!(!change.removed.contains(&7), "removed while still reachable");
        }

        lan_room.events.send(RoomEvent::Leave("peer".into())).unwrap();
        wait_until(|| !presence.contains(7)).await;
        assert_eq!(lan.peers().len(), 0);
    }

    #[tokio::test]
    async fn test_synced_needs_at_least_one_session() {
        let (room, provider, _) = scripted(20);
        let mut events = provider.events();
        assert!(!provider.is_synced());

        room.events.send(RoomEvent::Join("peer".into())).unwrap();
        wait_until(|| provider.peers().len() == 1).await;
        assert!(!provider.is_synced());

        let state = SharedDocument::new(9).encode_update(None).unwrap();
        room.inject
            .send(("peer".into(), Frame::SyncStep2(state).encode()))
            .unwrap();
        wait_until(|| provider.is_synced()).await;

        room.events.send(RoomEvent::Leave("peer".into())).unwrap();
        wait_until(|| provider.peers().is_empty()).await;
        assert!(!provider.is_synced());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProviderEvent::Synced(synced) = event {
                seen.push(synced);
            }
        }
        assert_eq!(seen, vec![true, false]);
    }

    #[tokio::test]
    async fn test_reconcile_opens_missed_sessions_and_removes_nothing() {
        let (room, provider, _) = scripted(20);
        room.events.send(RoomEvent::Join("tracked".into())).unwrap();
        wait_until(|| provider.peers().len() == 1).await;

        // Visible at the transport layer without a join event; "tracked"
        // is no longer listed there.
        *room.live.lock() = vec!["missed".to_string()];
        assert_eq!(provider.reconcile(), vec!["missed".to_string()]);

        let mut peers = provider.peers();
        peers.sort();
        assert_eq!(peers, vec!["missed".to_string(), "tracked".to_string()]);
        assert!(provider.reconcile().is_empty());
    }

    #[tokio::test]
    async fn test_local_changes_fan_out_but_own_do_not() {
        let (room, provider, presence) = scripted(20);
        room.events.send(RoomEvent::Join("peer".into())).unwrap();
        wait_until(|| provider.peers().len() == 1).await;
        room.recorder.take();

        presence.set_local_field("cursor", json!(3));
        wait_until(|| !room.recorder.sent.lock().is_empty()).await;
        assert!(matches!(room.recorder.take()[0], Frame::Presence(_)));

        // Applied with the provider's own tag: must not echo.
        let other = PresenceTable::new(9);
        other.set_local_state(Some(json!({})));
        presence
            .apply_update(
                &other.encode_full().unwrap(),
                Origin::Provider(provider.tag().clone()),
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(room.recorder.take().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (room, provider, _) = scripted(20);
        room.events.send(RoomEvent::Join("peer".into())).unwrap();
        wait_until(|| provider.peers().len() == 1).await;

        provider.destroy().await;
        provider.destroy().await;
        assert!(provider.peers().is_empty());
        assert!(!provider.is_connected());
        assert!(room.closed.is_cancelled());
    }

    fn join_room(broker: &MemoryBroker, id: &str) -> Arc<dyn Room> {
        TopicRoom::join(Arc::new(broker.open()), TopicRoomConfig::new("notes", id))
            .map(|room| room as Arc<dyn Room>)
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_providers_converge_and_report_synced() {
        let broker = MemoryBroker::new();
        let doc_a = Arc::new(SharedDocument::new(1));
        let doc_b = Arc::new(SharedDocument::new(2));
        let pres_a = Arc::new(PresenceTable::new(1));
        let pres_b = Arc::new(PresenceTable::new(2));
        doc_a.set("a", json!("from a")).unwrap();
        doc_b.set("b", json!("from b")).unwrap();
        pres_a.set_local_state(Some(json!({"name": "a"})));
        pres_b.set_local_state(Some(json!({"name": "b"})));

        let a = ReplicationProvider::connect(
            join_room(&broker, "pa"),
            doc_a.clone(),
            pres_a.clone(),
            "notes",
            ProviderOptions::default(),
        );
        let b = ReplicationProvider::connect(
            join_room(&broker, "pb"),
            doc_b.clone(),
            pres_b.clone(),
            "notes",
            ProviderOptions::default(),
        );

        wait_until(|| a.is_synced() && b.is_synced()).await;
        assert_eq!(doc_a.to_json(), doc_b.to_json());
        wait_until(|| pres_a.contains(2) && pres_b.contains(1)).await;

        doc_a.set("later", json!(true)).unwrap();
        wait_until(|| doc_b.get("later") == Some(json!(true))).await;

        b.destroy().await;
        wait_until(|| !a.is_synced()).await;
        a.destroy().await;
    }

    #[tokio::test]
    async fn test_local_bus_links_co_located_replicas() {
        let bus = LocalBus::new();
        let doc_a = Arc::new(SharedDocument::new(1));
        let doc_b = Arc::new(SharedDocument::new(2));
        doc_a.set("early", json!(1)).unwrap();

        let options = ProviderOptions {
            max_peers: 20,
            local_bus: Some(bus),
        };
        let a = ReplicationProvider::connect(
            ScriptedRoom::new(),
            doc_a.clone(),
            Arc::new(PresenceTable::new(1)),
            "notes",
            options.clone(),
        );
        let b = ReplicationProvider::connect(
            ScriptedRoom::new(),
            doc_b.clone(),
            Arc::new(PresenceTable::new(2)),
            "notes",
            options,
        );

        wait_until(|| doc_b.get("early") == Some(json!(1))).await;
        doc_b.set("late", json!(2)).unwrap();
        wait_until(|| doc_a.get("late") == Some(json!(2))).await;

        a.destroy().await;
        b.destroy().await;
    }

    #[test]
    fn test_default_options() {
        let options = ProviderOptions::default();
        assert_eq!(options.max_peers, 20);
        assert!(options.local_bus.is_none());
    }
}
