//! Per-peer sync state machine.
//!
//! ```text
//! JustJoined --open()--> AwaitingReciprocalSync --step 2--> Synced
//!      \___________________________|_____________________/
//!                                  v
//!                               Closed (leave)
//! ```
//!
//! On open the session immediately sends our state vector (sync step 1) and the
//! full presence table, in that order, on the peer's ordered channel.

use crate::error::{RoomError, SyncError};
use crate::origin::{Origin, ProviderTag};
use crate::presence::{ClientId, PresenceTable};
use crate::replica::DocumentReplica;
use crate::room::{ActionSender, PeerId};
use bytes::Bytes;
use meshsync_proto::Frame;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{Span, debug};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    JustJoined,
    AwaitingReciprocalSync,
    Synced,
    Closed,
}

/// One remote participant as seen by one provider.
pub struct PeerSession {
    peer: PeerId,
    sender: ActionSender,
    tag: ProviderTag,
    replica: Arc<dyn DocumentReplica>,
    presence: Arc<PresenceTable>,
    state: SessionState,
    synced: bool,
    connected: bool,
    /// Presence clients whose latest delta arrived through this session.
    clients: HashSet<ClientId>,
    span: Span,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("clients", &self.clients)
            .finish()
    }
}

impl PeerSession {
    /// Create the session and send the opening step 1 + presence snapshot.
    pub fn open(
        peer: PeerId,
        sender: ActionSender,
        tag: ProviderTag,
        replica: Arc<dyn DocumentReplica>,
        presence: Arc<PresenceTable>,
    ) -> Self {
        let span = crate::telemetry::spans::peer_session(tag.label(), &peer);
        let mut session = Self {
            peer,
            sender,
            tag,
            replica,
            presence,
            state: SessionState::JustJoined,
            synced: false,
            connected: true,
            clients: HashSet::new(),
            span,
        };
        session.send_opening();
        session
    }

    fn send_opening(&mut self) {
        let _enter = self.span.clone().entered();
        match self.replica.state_vector() {
            Ok(sv) => self.send_or_log(&Frame::SyncStep1(sv)),
            Err(e) => debug!(error = %e, "Could not encode state vector"),
        }
        self.presence.touch_local();
        self.send_presence();
        self.state = SessionState::AwaitingReciprocalSync;
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn clients(&self) -> &HashSet<ClientId> {
        &self.clients
    }

    /// Send one frame to this peer. A closed session sends nothing.
    pub fn send(&self, frame: &Frame) -> Result<(), RoomError> {
        if !self.connected {
            return Err(RoomError::Closed);
        }
        self.sender.send(&frame.encode(), Some(&self.peer))
    }

    fn send_or_log(&self, frame: &Frame) {
        if let Err(e) = self.send(frame) {
            debug!(kind = frame.kind_name(), error = %e, "Send to peer failed");
        }
    }

    fn send_presence(&self) {
        match self.presence.encode_full() {
            Ok(delta) => self.send_or_log(&Frame::Presence(Bytes::from(delta))),
            Err(e) => debug!(error = %e, "Could not encode presence"),
        }
    }

    /// Handle one raw frame from the peer. Returns true when this frame made
    /// the session synced. Malformed input is logged and dropped.
    pub fn receive(&mut self, raw: &[u8]) -> bool {
        if !self.connected {
            return false;
        }
        let _enter = self.span.clone().entered();
        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                crate::metrics::record_decode_fault("frame");
                debug!(error = %e, "Dropping malformed frame");
                return false;
            }
        };
        crate::metrics::record_frame(frame.kind_name());

        match self.dispatch(frame) {
            Ok(became_synced) => became_synced,
            Err(e) => {
                crate::metrics::record_decode_fault(e.error_code());
                debug!(error = %e, "Dropping frame that failed to apply");
                false
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<bool, SyncError> {
        let origin = Origin::Provider(self.tag.clone());
        match frame {
            Frame::SyncStep1(sv) => {
                let diff = self.replica.encode_update(Some(&sv))?;
                self.send_or_log(&Frame::SyncStep2(diff));
                Ok(false)
            }
            Frame::SyncStep2(update) => {
                self.replica.apply_update(&update, origin)?;
                if self.synced {
                    return Ok(false);
                }
                self.synced = true;
                self.state = SessionState::Synced;
                debug!("Peer synced");
                Ok(true)
            }
            Frame::Update(update) => {
                self.replica.apply_update(&update, origin)?;
                Ok(false)
            }
            Frame::QueryPresence => {
                self.send_presence();
                Ok(false)
            }
            Frame::Presence(delta) => {
                let change = self.presence.apply_update(&delta, origin)?;
                self.clients.extend(&change.announced);
                for id in &change.withdrawn {
                    self.clients.remove(id);
                }
                Ok(false)
            }
            Frame::Unknown(kind) => {
                debug!(kind, "Ignoring frame of unknown kind");
                Ok(false)
            }
        }
    }

    /// Mark the session closed. No further frames are sent or handled.
    pub fn close(&mut self) {
        self.connected = false;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::replica::SharedDocument;
    use crate::room::ActionTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every frame sent, by target.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub sent: Mutex<Vec<(Option<String>, Frame)>>,
    }

    impl ActionTransport for Recorder {
        fn send_action(&self, _tag: &str, data: &[u8], to: Option<&str>) -> Result<(), RoomError> {
            let frame = Frame::decode(data).map_err(|e| RoomError::Signaling(e.to_string()))?;
            self.sent.lock().push((to.map(str::to_string), frame));
            Ok(())
        }
    }

    impl Recorder {
        pub(crate) fn take(&self) -> Vec<Frame> {
            self.sent.lock().drain(..).map(|(_, f)| f).collect()
        }
    }

    fn session(
        client: u64,
    ) -> (PeerSession, Arc<Recorder>, Arc<SharedDocument>, Arc<PresenceTable>) {
        let recorder = Arc::new(Recorder::default());
        let sender = ActionSender::new("sync", recorder.clone());
        let doc = Arc::new(SharedDocument::new(client));
        let presence = Arc::new(PresenceTable::new(client));
        presence.set_local_state(Some(json!({"name": format!("c{client}")})));
        let s = PeerSession::open(
            "remote".into(),
            sender,
            ProviderTag::new("room"),
            doc.clone(),
            presence.clone(),
        );
        (s, recorder, doc, presence)
    }

    #[test]
    fn test_open_sends_step1_then_presence() {
        let (s, recorder, _, _) = session(1);
        let sent = recorder.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, Frame::SyncStep1(_)));
        assert!(matches!(sent[1].1, Frame::Presence(_)));
        assert_eq!(sent[0].0.as_deref(), Some("remote"));
        assert_eq!(s.state(), SessionState::AwaitingReciprocalSync);
        assert!(!s.is_synced());
    }

    #[test]
    fn test_full_handshake_between_two_sessions() {
        let (mut a, rec_a, doc_a, _) = session(1);
        let (mut b, rec_b, doc_b, pres_b) = session(2);
        doc_a.set("from_a", json!(1)).unwrap();
        doc_b.set("from_b", json!(2)).unwrap();
        // Discard the openings built before the writes.
        rec_a.take();
        rec_b.take();
        a.send_opening();
        b.send_opening();

        let mut became_synced = (false, false);
        for _ in 0..3 {
            for frame in rec_a.take() {
                became_synced.1 |= b.receive(&frame.encode());
            }
            for frame in rec_b.take() {
                became_synced.0 |= a.receive(&frame.encode());
            }
        }

        assert!(became_synced.0 && became_synced.1);
        assert!(a.is_synced() && b.is_synced());
        assert_eq!(doc_a.to_json(), doc_b.to_json());
        assert!(pres_b.contains(1));
        assert!(b.clients().contains(&1));
    }

    #[test]
    fn test_synced_flips_at_most_once() {
        let (mut s, _, _, _) = session(1);
        let other = SharedDocument::new(9);
        let step2 = Frame::SyncStep2(other.encode_update(None).unwrap()).encode();
        assert!(s.receive(&step2));
        assert!(!s.receive(&step2));
        assert!(s.is_synced());
    }

    #[test]
    fn test_update_does_not_mark_synced() {
        let (mut s, _, doc, _) = session(1);
        let other = SharedDocument::new(9);
        other.set("k", json!("v")).unwrap();
        let update = Frame::Update(other.encode_update(None).unwrap()).encode();
        assert!(!s.receive(&update));
        assert!(!s.is_synced());
        assert_eq!(doc.get("k"), Some(json!("v")));
    }

    #[test]
    fn test_query_presence_is_answered() {
        let (mut s, recorder, _, _) = session(1);
        recorder.take();
        s.receive(&Frame::QueryPresence.encode());
        let sent = recorder.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], Frame::Presence(_)));
    }

    #[test]
    fn test_garbage_and_unknown_are_dropped() {
        let (mut s, recorder, _, _) = session(1);
        recorder.take();
        assert!(!s.receive(&[]));
        assert!(!s.receive(&[0, 1, 0xff, 0xff]));
        assert!(!s.receive(&[77, 1, 2, 3]));
        assert!(s.is_connected());
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_closed_session_is_inert() {
        let (mut s, recorder, _, _) = session(1);
        recorder.take();
        s.close();
        assert!(s.send(&Frame::QueryPresence).is_err());
        assert!(!s.receive(&Frame::QueryPresence.encode()));
        assert!(recorder.take().is_empty());
        assert_eq!(s.state(), SessionState::Closed);
    }
}
