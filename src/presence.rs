//! Shared presence table.
//!
//! Maps a numeric client id to a small JSON state blob (display name, device
//! id, IP hint, cursor). Each entry carries a per-client clock: a delta only
//! wins if its clock is newer, and a removal is a delta with a `null` state and
//! a bumped clock, so removals replicate like any other change.
//!
//! Every mutation is published on a broadcast bus as a [`PresenceChange`]
//! tagged with its [`Origin`].
//!
//! The table also records which providers back each remote client. A provider
//! losing contact releases only its own hold; the entry goes away once no
//! provider backs it.

use crate::error::SyncError;
use crate::origin::{Origin, ProviderTag};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tokio::sync::broadcast;
use tracing::debug;

/// Numeric presence client id.
pub type ClientId = u64;

const CHANGE_CHANNEL_SIZE: usize = 1024;

/// A batch of presence changes, all applied with the same origin.
#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    /// Same state under a newer clock: a liveness renewal.
    pub renewed: Vec<ClientId>,
    /// Remote clients the delta carried a live state for, changed or not.
    pub announced: Vec<ClientId>,
    /// Remote clients the delta carried a removal for, applied or not.
    pub withdrawn: Vec<ClientId>,
    pub origin: Origin,
}

impl PresenceChange {
    fn new(origin: Origin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            renewed: Vec::new(),
            announced: Vec::new(),
            withdrawn: Vec::new(),
            origin,
        }
    }

    /// True when the table itself did not change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.renewed.is_empty()
    }

    /// Every client id whose entry changed or was renewed.
    pub fn all(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .chain(&self.renewed)
            .copied()
            .collect()
    }

    fn is_silent(&self) -> bool {
        self.is_empty() && self.announced.is_empty() && self.withdrawn.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEntry {
    client_id: ClientId,
    clock: u64,
    state: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireUpdate {
    entries: Vec<WireEntry>,
}

#[derive(Debug, Clone, Copy)]
struct Meta {
    clock: u64,
    last_updated: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<ClientId, Value>,
    /// Kept after removal so stale deltas cannot resurrect an entry.
    meta: HashMap<ClientId, Meta>,
    /// Providers through which each remote client is reachable.
    backers: HashMap<ClientId, Vec<ProviderTag>>,
}

impl Inner {
    fn back(&mut self, client_id: ClientId, tag: &ProviderTag) {
        let backers = self.backers.entry(client_id).or_default();
        if !backers.contains(tag) {
            backers.push(tag.clone());
        }
    }

    /// Drop `tag`'s hold on `client_id`. True when it held the last one.
    fn unback(&mut self, client_id: ClientId, tag: &ProviderTag) -> bool {
        let Some(backers) = self.backers.get_mut(&client_id) else {
            return false;
        };
        let before = backers.len();
        backers.retain(|t| t != tag);
        let held = backers.len() != before;
        if backers.is_empty() {
            self.backers.remove(&client_id);
            return held;
        }
        false
    }

    fn backed_by_other(&self, client_id: ClientId, tag: Option<&ProviderTag>) -> bool {
        self.backers
            .get(&client_id)
            .is_some_and(|backers| backers.iter().any(|t| Some(t) != tag))
    }
}

/// Process-wide presence table shared by every strategy.
#[derive(Debug)]
pub struct PresenceTable {
    client_id: ClientId,
    inner: RwLock<Inner>,
    changes: broadcast::Sender<PresenceChange>,
}

impl PresenceTable {
    pub fn new(client_id: ClientId) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            client_id,
            inner: RwLock::new(Inner::default()),
            changes,
        }
    }

    /// This process's own client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChange> {
        self.changes.subscribe()
    }

    pub fn local_state(&self) -> Option<Value> {
        self.inner.read().states.get(&self.client_id).cloned()
    }

    pub fn state(&self, client_id: ClientId) -> Option<Value> {
        self.inner.read().states.get(&client_id).cloned()
    }

    /// Snapshot of every live entry.
    pub fn states(&self) -> HashMap<ClientId, Value> {
        self.inner.read().states.clone()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.inner.read().states.contains_key(&client_id)
    }

    /// Replace (or with `None`, remove) the local entry.
    pub fn set_local_state(&self, state: Option<Value>) {
        let mut change = PresenceChange::new(Origin::Local);
        {
            let mut inner = self.inner.write();
            let clock = inner.meta.get(&self.client_id).map_or(0, |m| m.clock) + 1;
            let existed = inner.states.contains_key(&self.client_id);
            match state {
                Some(state) => {
                    inner.states.insert(self.client_id, state);
                    if existed {
                        change.updated.push(self.client_id);
                    } else {
                        change.added.push(self.client_id);
                    }
                }
                None => {
                    inner.states.remove(&self.client_id);
                    if existed {
                        change.removed.push(self.client_id);
                    }
                }
            }
            inner.meta.insert(
                self.client_id,
                Meta {
                    clock,
                    last_updated: Instant::now(),
                },
            );
        }
        self.emit(change);
    }

    /// Set one field of the local entry, creating it when absent.
    pub fn set_local_field(&self, field: &str, value: Value) {
        let mut state = match self.local_state() {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        state.insert(field.to_string(), value);
        self.set_local_state(Some(Value::Object(state)));
    }

    /// Encode the given clients (live or removed) as a delta.
    pub fn encode_update(&self, clients: &[ClientId]) -> Result<Vec<u8>, SyncError> {
        let inner = self.inner.read();
        let entries = clients
            .iter()
            .filter_map(|id| {
                inner.meta.get(id).map(|meta| WireEntry {
                    client_id: *id,
                    clock: meta.clock,
                    state: inner.states.get(id).cloned(),
                })
            })
            .collect();
        rmp_serde::to_vec(&WireUpdate { entries })
            .map_err(|e| SyncError::PresenceEncode(e.to_string()))
    }

    /// Encode every live entry.
    pub fn encode_full(&self) -> Result<Vec<u8>, SyncError> {
        let ids: Vec<ClientId> = self.inner.read().states.keys().copied().collect();
        self.encode_update(&ids)
    }

    /// Apply a remote delta. Returns what changed; a change that neither
    /// touched the table nor carried any remote client emits no event.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<PresenceChange, SyncError> {
        let wire: WireUpdate =
            rmp_serde::from_slice(update).map_err(|e| SyncError::PresenceDecode(e.to_string()))?;
        let now = Instant::now();
        let tag = match &origin {
            Origin::Provider(tag) => Some(tag.clone()),
            Origin::Local => None,
        };
        let mut change = PresenceChange::new(origin);
        let mut reassert_local = false;

        {
            let mut inner = self.inner.write();
            for entry in wire.entries {
                let current_clock = inner.meta.get(&entry.client_id).map_or(0, |m| m.clock);
                let present = inner.states.contains_key(&entry.client_id);
                let remote = entry.client_id != self.client_id;
                if remote {
                    if entry.state.is_some() {
                        change.announced.push(entry.client_id);
                        if let Some(tag) = &tag {
                            inner.back(entry.client_id, tag);
                        }
                    } else {
                        change.withdrawn.push(entry.client_id);
                    }
                }
                let newer = current_clock < entry.clock
                    || (current_clock == entry.clock && entry.state.is_none() && present);
                if !newer {
                    continue;
                }

                match entry.state {
                    None if !remote && present => {
                        // Remote peers cannot remove this process's own entry.
                        let clock = entry.clock + 1;
                        inner.meta.insert(
                            self.client_id,
                            Meta {
                                clock,
                                last_updated: now,
                            },
                        );
                        reassert_local = true;
                    }
                    None => {
                        if current_clock == entry.clock {
                            // A relay lost contact; the owner did not leave.
                            if let Some(tag) = &tag {
                                inner.unback(entry.client_id, tag);
                            }
                            if inner.backed_by_other(entry.client_id, tag.as_ref()) {
                                continue;
                            }
                        }
                        inner.meta.insert(
                            entry.client_id,
                            Meta {
                                clock: entry.clock,
                                last_updated: now,
                            },
                        );
                        inner.backers.remove(&entry.client_id);
                        if inner.states.remove(&entry.client_id).is_some() {
                            change.removed.push(entry.client_id);
                        }
                    }
                    Some(state) => {
                        inner.meta.insert(
                            entry.client_id,
                            Meta {
                                clock: entry.clock,
                                last_updated: now,
                            },
                        );
                        let previous = inner.states.insert(entry.client_id, state.clone());
                        match previous {
                            None => change.added.push(entry.client_id),
                            Some(prev) if prev != state => change.updated.push(entry.client_id),
                            Some(_) => change.renewed.push(entry.client_id),
                        }
                    }
                }
            }
        }

        if reassert_local {
            debug!(client_id = self.client_id, "Remote delta tried to remove local presence; reasserting");
            let mut local = PresenceChange::new(Origin::Local);
            local.updated.push(self.client_id);
            self.emit(local);
        }

        let result = change.clone();
        self.emit(change);
        Ok(result)
    }

    /// Remove entries (never the local one). Clocks are kept, so the
    /// encoded removal still wins over holders at the same clock while the
    /// owner's next bump re-adds the entry.
    pub fn remove_states(&self, clients: &[ClientId], origin: Origin) {
        let mut change = PresenceChange::new(origin);
        {
            let mut inner = self.inner.write();
            let now = Instant::now();
            for id in clients {
                if *id == self.client_id {
                    continue;
                }
                inner.backers.remove(id);
                if inner.states.remove(id).is_some() {
                    if let Some(meta) = inner.meta.get_mut(id) {
                        meta.last_updated = now;
                    }
                    change.removed.push(*id);
                }
            }
        }
        self.emit(change);
    }

    /// Release `tag`'s hold on `clients` after its sessions to them closed.
    /// Entries no other provider backs are removed; returns those.
    pub fn release(&self, clients: &[ClientId], tag: &ProviderTag) -> Vec<ClientId> {
        let orphaned: Vec<ClientId> = {
            let mut inner = self.inner.write();
            clients
                .iter()
                .copied()
                .filter(|id| *id != self.client_id)
                .filter(|id| inner.unback(*id, tag))
                .collect()
        };
        if !orphaned.is_empty() {
            self.remove_states(&orphaned, Origin::Provider(tag.clone()));
        }
        orphaned
    }

    /// Release every hold `tag` still has, when its provider goes away.
    pub fn release_all(&self, tag: &ProviderTag) -> Vec<ClientId> {
        let held: Vec<ClientId> = self
            .inner
            .read()
            .backers
            .iter()
            .filter(|(_, backers)| backers.contains(tag))
            .map(|(id, _)| *id)
            .collect();
        self.release(&held, tag)
    }

    /// Number of providers currently backing `client_id`.
    pub fn backers(&self, client_id: ClientId) -> usize {
        self.inner.read().backers.get(&client_id).map_or(0, Vec::len)
    }

    /// Bump the local clock without emitting a change. A fresh session's
    /// snapshot then supersedes whatever the peer kept from an earlier one.
    pub fn touch_local(&self) {
        let mut inner = self.inner.write();
        if !inner.states.contains_key(&self.client_id) {
            return;
        }
        let clock = inner.meta.get(&self.client_id).map_or(0, |m| m.clock) + 1;
        inner.meta.insert(
            self.client_id,
            Meta {
                clock,
                last_updated: Instant::now(),
            },
        );
    }

    /// Drop remote entries that were not refreshed within `timeout`.
    pub fn remove_outdated(&self, timeout: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let stale: Vec<ClientId> = {
            let inner = self.inner.read();
            inner
                .states
                .keys()
                .filter(|id| **id != self.client_id)
                .filter(|id| {
                    inner
                        .meta
                        .get(id)
                        .is_some_and(|m| now.duration_since(m.last_updated) >= timeout)
                })
                .copied()
                .collect()
        };
        if !stale.is_empty() {
            debug!(count = stale.len(), "Expiring outdated presence entries");
            self.remove_states(&stale, Origin::Local);
        }
        stale
    }

    /// Re-publish the local entry when it is older than `interval`, so peers
    /// see a fresh liveness marker.
    pub fn renew_local(&self, interval: Duration) -> bool {
        let due = {
            let inner = self.inner.read();
            inner.states.contains_key(&self.client_id)
                && inner
                    .meta
                    .get(&self.client_id)
                    .is_some_and(|m| m.last_updated.elapsed() >= interval)
        };
        if due {
            let state = self.local_state();
            self.set_local_state(state);
        }
        due
    }

    fn emit(&self, change: PresenceChange) {
        if !change.is_silent() {
            // No receivers is fine: nobody is replicating yet.
            let _ = self.changes.send(change);
        }
    }
}

/// Display name carried in a presence state (`user.name` or `name`).
pub fn state_name(state: &Value) -> Option<String> {
    state
        .pointer("/user/name")
        .or_else(|| state.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// IP hint carried in a presence state (`user.ip` or `ip`).
pub fn state_ip(state: &Value) -> Option<String> {
    state
        .pointer("/user/ip")
        .or_else(|| state.get("ip"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::ProviderTag;
    use serde_json::json;

    #[test]
    fn test_local_state_round_trip_between_tables() {
        let a = PresenceTable::new(1);
        let b = PresenceTable::new(2);
        a.set_local_state(Some(json!({"name": "alice"})));

        let tag = ProviderTag::new("room");
        let change = b
            .apply_update(&a.encode_full().unwrap(), Origin::Provider(tag.clone()))
            .unwrap();
        assert_eq!(change.added, vec![1]);
        assert!(change.origin.is_from(&tag));
        assert_eq!(b.state(1), Some(json!({"name": "alice"})));
    }

    #[test]
    fn test_stale_delta_is_ignored() {
        let a = PresenceTable::new(1);
        let b = PresenceTable::new(2);
        a.set_local_state(Some(json!({"v": 1})));
        let old = a.encode_full().unwrap();
        a.set_local_state(Some(json!({"v": 2})));
        let new = a.encode_full().unwrap();

        b.apply_update(&new, Origin::Local).unwrap();
        let change = b.apply_update(&old, Origin::Local).unwrap();
        assert!(change.is_empty());
        // The sender still speaks for client 1.
        assert_eq!(change.announced, vec![1]);
        assert_eq!(b.state(1), Some(json!({"v": 2})));
    }

    #[test]
    fn test_removal_replicates_and_blocks_resurrection() {
        let a = PresenceTable::new(1);
        let b = PresenceTable::new(2);
        a.set_local_state(Some(json!({"v": 1})));
        let alive = a.encode_full().unwrap();
        b.apply_update(&alive, Origin::Local).unwrap();

        a.set_local_state(None);
        let gone = a.encode_update(&[1]).unwrap();
        let change = b.apply_update(&gone, Origin::Local).unwrap();
        assert_eq!(change.removed, vec![1]);

        let change = b.apply_update(&alive, Origin::Local).unwrap();
        assert!(change.is_empty());
        assert!(!b.contains(1));
    }

    #[test]
    fn test_remote_cannot_remove_local_entry() {
        let me = PresenceTable::new(1);
        me.set_local_state(Some(json!({"name": "me"})));
        let mut rx = me.subscribe();

        let other = PresenceTable::new(1);
        other.set_local_state(Some(json!({})));
        other.set_local_state(Some(json!({})));
        other.set_local_state(None);
        let removal = other.encode_update(&[1]).unwrap();

        me.apply_update(&removal, Origin::Local).unwrap();
        assert!(me.contains(1));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.updated, vec![1]);
        assert_eq!(change.origin, Origin::Local);
    }

    #[test]
    fn test_remove_states_skips_local() {
        let table = PresenceTable::new(1);
        table.set_local_state(Some(json!({})));
        let peer = PresenceTable::new(5);
        peer.set_local_state(Some(json!({})));
        table
            .apply_update(&peer.encode_full().unwrap(), Origin::Local)
            .unwrap();

        table.remove_states(&[1, 5], Origin::Local);
        assert!(table.contains(1));
        assert!(!table.contains(5));
    }

    #[test]
    fn test_removed_peer_returns_after_touch() {
        let table = PresenceTable::new(1);
        let peer = PresenceTable::new(5);
        peer.set_local_state(Some(json!({"name": "five"})));
        let snapshot = peer.encode_full().unwrap();
        table.apply_update(&snapshot, Origin::Local).unwrap();

        table.remove_states(&[5], Origin::Local);
        assert!(table.apply_update(&snapshot, Origin::Local).unwrap().is_empty());

        peer.touch_local();
        let change = table
            .apply_update(&peer.encode_full().unwrap(), Origin::Local)
            .unwrap();
        assert_eq!(change.added, vec![5]);
    }

    #[test]
    fn test_remove_outdated_with_zero_timeout() {
        let table = PresenceTable::new(1);
        table.set_local_state(Some(json!({})));
        let peer = PresenceTable::new(5);
        peer.set_local_state(Some(json!({})));
        table
            .apply_update(&peer.encode_full().unwrap(), Origin::Local)
            .unwrap();

        let removed = table.remove_outdated(Duration::ZERO);
        assert_eq!(removed, vec![5]);
        assert!(table.contains(1));
    }

    #[test]
    fn test_renewal_is_reported_as_a_change() {
        let a = PresenceTable::new(1);
        let b = PresenceTable::new(2);
        a.set_local_state(Some(json!({"name": "alice"})));
        b.apply_update(&a.encode_full().unwrap(), Origin::Local).unwrap();

        assert!(a.renew_local(Duration::ZERO));
        let mut rx = b.subscribe();
        let change = b.apply_update(&a.encode_full().unwrap(), Origin::Local).unwrap();
        assert_eq!(change.renewed, vec![1]);
        assert!(!change.is_empty());
        assert_eq!(change.all(), vec![1]);
        assert_eq!(rx.try_recv().unwrap().renewed, vec![1]);
    }

    #[test]
    fn test_known_client_from_second_provider_is_announced() {
        let table = PresenceTable::new(1);
        let peer = PresenceTable::new(5);
        peer.set_local_state(Some(json!({})));
        let snapshot = peer.encode_full().unwrap();
        let lan = ProviderTag::new("notes");
        let internet = ProviderTag::new("notes");
        table.apply_update(&snapshot, Origin::Provider(lan)).unwrap();

        let mut rx = table.subscribe();
        table
            .apply_update(&snapshot, Origin::Provider(internet.clone()))
            .unwrap();
        let change = rx.try_recv().expect("announce-only change not emitted");
        assert!(change.is_empty());
        assert_eq!(change.announced, vec![5]);
        assert!(change.origin.is_from(&internet));
        assert_eq!(table.backers(5), 2);
    }

    #[test]
    fn test_release_removes_only_when_nothing_backs() {
        let table = PresenceTable::new(1);
        let peer = PresenceTable::new(5);
        peer.set_local_state(Some(json!({})));
        let snapshot = peer.encode_full().unwrap();
        let lan = ProviderTag::new("notes");
        let internet = ProviderTag::new("notes");
        table.apply_update(&snapshot, Origin::Provider(lan.clone())).unwrap();
        table
            .apply_update(&snapshot, Origin::Provider(internet.clone()))
            .unwrap();

        assert!(table.release(&[5], &internet).is_empty());
        assert!(table.contains(5));
        // Releasing twice is harmless.
        assert!(table.release(&[5], &internet).is_empty());
        assert_eq!(table.release(&[5], &lan), vec![5]);
        assert!(!table.contains(5));
        assert_eq!(table.backers(5), 0);
    }

    #[test]
    fn test_relayed_loss_of_contact_keeps_entry_backed_elsewhere() {
        let table = PresenceTable::new(1);
        let owner = PresenceTable::new(5);
        owner.set_local_state(Some(json!({})));
        let snapshot = owner.encode_full().unwrap();
        let lan = ProviderTag::new("notes");
        let internet = ProviderTag::new("notes");
        table.apply_update(&snapshot, Origin::Provider(lan.clone())).unwrap();
        table
            .apply_update(&snapshot, Origin::Provider(internet.clone()))
            .unwrap();

        // A relay that lost client 5 removes it at the same clock.
        let relay = PresenceTable::new(9);
        relay.apply_update(&snapshot, Origin::Local).unwrap();
        relay.remove_states(&[5], Origin::Local);
        let lost = relay.encode_update(&[5]).unwrap();

        let change = table
            .apply_update(&lost, Origin::Provider(internet))
            .unwrap();
        assert!(change.removed.is_empty());
        assert_eq!(change.withdrawn, vec![5]);
        assert!(table.contains(5));
        assert_eq!(table.backers(5), 1);

        let change = table.apply_update(&lost, Origin::Provider(lan)).unwrap();
        assert_eq!(change.removed, vec![5]);
    }

    #[test]
    fn test_owner_leaving_wins_over_backers() {
        let table = PresenceTable::new(1);
        let owner = PresenceTable::new(5);
        owner.set_local_state(Some(json!({})));
        let lan = ProviderTag::new("notes");
        let internet = ProviderTag::new("notes");
        let snapshot = owner.encode_full().unwrap();
        table.apply_update(&snapshot, Origin::Provider(lan)).unwrap();
        table
            .apply_update(&snapshot, Origin::Provider(internet.clone()))
            .unwrap();

        owner.set_local_state(None);
        let change = table
            .apply_update(&owner.encode_update(&[5]).unwrap(), Origin::Provider(internet))
            .unwrap();
        assert_eq!(change.removed, vec![5]);
        assert_eq!(table.backers(5), 0);
    }

    #[test]
    fn test_malformed_delta_is_an_error() {
        let table = PresenceTable::new(1);
        assert!(matches!(
            table.apply_update(b"\xff\xff", Origin::Local),
            Err(SyncError::PresenceDecode(_))
        ));
    }

    #[test]
    fn test_state_helpers() {
        let nested = json!({"user": {"name": "bob", "ip": "10.0.0.2"}});
        assert_eq!(state_name(&nested).as_deref(), Some("bob"));
        assert_eq!(state_ip(&nested).as_deref(), Some("10.0.0.2"));
        assert_eq!(state_name(&json!({"name": "flat"})).as_deref(), Some("flat"));
        assert_eq!(state_ip(&json!({})), None);
    }
}
