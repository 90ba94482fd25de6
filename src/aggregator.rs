//! Merges the peer lists and statuses of every registered strategy.
//!
//! A client reported by both the canonical local and internet strategies is
//! classified `both`. Reports from any other strategy id fall back to the
//! policy's `unknown_source`.

use crate::presence::ClientId;
use crate::strategy::{
    ConnectionStatus, ConnectionStrategy, INTERNET_STRATEGY_ID, LOCAL_STRATEGY_ID,
    StrategyPeerRecord,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerSource {
    Local,
    Internet,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPeer {
    pub client_id: ClientId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub source: PeerSource,
}

/// Which strategy ids count as local and internet.
#[derive(Debug, Clone)]
pub struct AggregatorPolicy {
    pub local_id: String,
    pub internet_id: String,
    /// Source for clients reported only by other strategies.
    pub unknown_source: PeerSource,
}

impl Default for AggregatorPolicy {
    fn default() -> Self {
        Self {
            local_id: LOCAL_STRATEGY_ID.to_string(),
            internet_id: INTERNET_STRATEGY_ID.to_string(),
            unknown_source: PeerSource::Internet,
        }
    }
}

impl AggregatorPolicy {
    fn classify(&self, reporters: &BTreeSet<&str>) -> PeerSource {
        let local = reporters.contains(self.local_id.as_str());
        let internet = reporters.contains(self.internet_id.as_str());
        match (local, internet) {
            (true, true) => PeerSource::Both,
            (true, false) => PeerSource::Local,
            (false, true) => PeerSource::Internet,
            (false, false) => self.unknown_source,
        }
    }
}

#[derive(Debug)]
struct Entry {
    peers: Vec<StrategyPeerRecord>,
    status: ConnectionStatus,
}

impl Default for Entry {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            status: ConnectionStatus::Disconnected,
        }
    }
}

/// `connected` beats `connecting` beats `error` beats `disconnected`.
pub fn aggregate_status<I>(statuses: I) -> ConnectionStatus
where
    I: IntoIterator<Item = ConnectionStatus>,
{
    fn rank(status: ConnectionStatus) -> u8 {
        match status {
            ConnectionStatus::Connected => 3,
            ConnectionStatus::Connecting => 2,
            ConnectionStatus::Error => 1,
            ConnectionStatus::Disconnected => 0,
        }
    }
    statuses
        .into_iter()
        .max_by_key(|s| rank(*s))
        .unwrap_or(ConnectionStatus::Disconnected)
}

pub struct StrategyAggregator {
    policy: AggregatorPolicy,
    /// Keyed by strategy id, in registration order.
    entries: Mutex<Vec<(String, Entry)>>,
    peers_tx: watch::Sender<Vec<AggregatedPeer>>,
    status_tx: watch::Sender<ConnectionStatus>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for StrategyAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyAggregator")
            .field("strategies", &self.strategy_ids())
            .field("status", &self.status())
            .finish()
    }
}

impl StrategyAggregator {
    pub fn new(policy: AggregatorPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            entries: Mutex::new(Vec::new()),
            peers_tx: watch::channel(Vec::new()).0,
            status_tx: watch::channel(ConnectionStatus::Disconnected).0,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.entries.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn peers(&self) -> Vec<AggregatedPeer> {
        self.peers_tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub fn peer_updates(&self) -> watch::Receiver<Vec<AggregatedPeer>> {
        self.peers_tx.subscribe()
    }

    /// Fires only when the aggregate status actually changes.
    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn with_entry(&self, id: &str, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.entries.lock();
        match entries.iter_mut().find(|(key, _)| key == id) {
            Some((_, entry)) => f(entry),
            None => {
                let mut entry = Entry::default();
                f(&mut entry);
                entries.push((id.to_string(), entry));
            }
        }
    }

    pub fn update_peers(&self, id: &str, peers: Vec<StrategyPeerRecord>) {
        self.with_entry(id, |entry| entry.peers = peers);
        self.recompute_peers();
    }

    pub fn update_status(&self, id: &str, status: ConnectionStatus) {
        self.with_entry(id, |entry| entry.status = status);
        self.recompute_status();
    }

    /// Forget a strategy entirely.
    pub fn remove(&self, id: &str) {
        self.entries.lock().retain(|(key, _)| key != id);
        self.recompute_peers();
        self.recompute_status();
    }

    fn recompute_peers(&self) {
        let merged = {
            let entries = self.entries.lock();
            let mut reporters: BTreeMap<ClientId, (BTreeSet<&str>, &StrategyPeerRecord)> =
                BTreeMap::new();
            for (id, entry) in entries.iter() {
                for record in &entry.peers {
                    reporters
                        .entry(record.client_id)
                        .or_insert_with(|| (BTreeSet::new(), record))
                        .0
                        .insert(id.as_str());
                }
            }
            reporters
                .into_iter()
                .map(|(client_id, (ids, record))| AggregatedPeer {
                    client_id,
                    name: record.name.clone(),
                    ip: record.ip.clone(),
                    source: self.policy.classify(&ids),
                })
                .collect::<Vec<_>>()
        };
        let changed = self.peers_tx.send_if_modified(|current| {
            if *current == merged {
                return false;
            }
            *current = merged;
            true
        });
        if changed {
            debug!(count = self.peers_tx.borrow().len(), "Aggregated peers changed");
        }
    }

    fn recompute_status(&self) {
        let status = aggregate_status(self.entries.lock().iter().map(|(_, e)| e.status));
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(status = status.as_str(), "Aggregate status changed");
        }
    }

    /// Track a strategy's peers and status until it goes away or
    /// [`StrategyAggregator::shutdown`] is called.
    pub fn register(self: &Arc<Self>, strategy: &dyn ConnectionStrategy) {
        let id = strategy.id().to_string();
        let mut peers = strategy.peer_updates();
        let mut status = strategy.status_updates();
        self.update_peers(&id, peers.borrow_and_update().clone());
        self.update_status(&id, *status.borrow_and_update());
        debug!(strategy = %id, "Strategy registered");

        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = peers.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let list = peers.borrow_and_update().clone();
                        let Some(aggregator) = weak.upgrade() else { break };
                        aggregator.update_peers(&id, list);
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = *status.borrow_and_update();
                        let Some(aggregator) = weak.upgrade() else { break };
                        aggregator.update_status(&id, current);
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop following registered strategies.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for StrategyAggregator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
