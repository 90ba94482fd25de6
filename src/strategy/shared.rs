//! Machinery shared by every strategy: the connection supervisor, peer
//! attribution and status publication.
//!
//! A strategy only has to say how to open a room for its transport. The
//! supervisor opens it, wraps it in a provider, follows the provider until
//! the transport is lost and then reconnects with backoff until cancelled.

use super::{ConnectionStatus, StrategyPeerRecord};
use crate::crypto::RoomKey;
use crate::error::{CryptoError, StrategyError};
use crate::origin::{Origin, ProviderTag};
use crate::presence::{ClientId, PresenceChange, PresenceTable, state_ip, state_name};
use crate::probe::Backoff;
use crate::replica::DocumentReplica;
use crate::room::{Room, Signaling, TopicRoom, TopicRoomConfig};
use crate::sync::{LocalBus, ProviderEvent, ProviderOptions, ProviderStatus, ReplicationProvider};
use crate::telemetry::spans;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Tunables common to every strategy.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub max_peers: usize,
    /// In-process path to co-located replicas.
    pub local_bus: Option<LocalBus>,
    pub heartbeat: Duration,
    pub peer_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// Period of the additive peer reconciliation pass.
    pub reconcile_interval: Duration,
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            max_peers: 20,
            local_bus: None,
            heartbeat: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

/// How a strategy reaches its room.
#[async_trait]
pub(crate) trait RoomOpener: Send + Sync + 'static {
    async fn open(&self, room: &str) -> Result<Arc<dyn Room>, StrategyError>;
}

/// Join `room` on an open signaling connection with a fresh peer id.
pub(crate) fn join_topic(
    signaling: Arc<dyn Signaling>,
    room: &str,
    key: Option<Arc<RoomKey>>,
    settings: &StrategySettings,
) -> Result<Arc<dyn Room>, StrategyError> {
    let config = TopicRoomConfig {
        room: room.to_string(),
        self_id: uuid::Uuid::new_v4().to_string(),
        key,
        heartbeat: settings.heartbeat,
        peer_timeout: settings.peer_timeout,
    };
    let room = TopicRoom::join(signaling, config)?;
    Ok(room)
}

/// Derive the room key off the async runtime. An empty secret means none.
pub(crate) async fn derive_key(
    secret: Option<&str>,
    room: &str,
) -> Result<Option<Arc<RoomKey>>, StrategyError> {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let (secret, room) = (secret.to_string(), room.to_string());
    let key = tokio::task::spawn_blocking(move || RoomKey::derive(&secret, &room))
        .await
        .map_err(|_| CryptoError::KeySetup)??;
    Ok(Some(Arc::new(key)))
}

#[derive(Clone)]
struct Bound {
    replica: Arc<dyn DocumentReplica>,
    presence: Arc<PresenceTable>,
}

#[derive(Default)]
struct Link {
    cancel: Option<CancellationToken>,
    provider: Option<Arc<ReplicationProvider>>,
    supervisor: Option<JoinHandle<()>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    Cancelled,
    Lost,
}

pub(crate) struct StrategyCore {
    name: &'static str,
    settings: StrategySettings,
    bound: Mutex<Option<Bound>>,
    link: Mutex<Link>,
    /// Clients whose presence this strategy's provider relayed.
    attributed: Mutex<HashSet<ClientId>>,
    peers_tx: watch::Sender<Vec<StrategyPeerRecord>>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl StrategyCore {
    pub(crate) fn new(name: &'static str, settings: StrategySettings) -> Arc<Self> {
        Arc::new(Self {
            name,
            settings,
            bound: Mutex::new(None),
            link: Mutex::new(Link::default()),
            attributed: Mutex::new(HashSet::new()),
            peers_tx: watch::channel(Vec::new()).0,
            status_tx: watch::channel(ConnectionStatus::Disconnected).0,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn settings(&self) -> &StrategySettings {
        &self.settings
    }

    pub(crate) fn bind(&self, replica: Arc<dyn DocumentReplica>, presence: Arc<PresenceTable>) {
        *self.bound.lock() = Some(Bound { replica, presence });
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), StrategyError> {
        if self.bound.lock().is_some() {
            Ok(())
        } else {
            Err(StrategyError::NotInitialized(self.name))
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn peers(&self) -> Vec<StrategyPeerRecord> {
        self.peers_tx.borrow().clone()
    }

    pub(crate) fn peer_updates(&self) -> watch::Receiver<Vec<StrategyPeerRecord>> {
        self.peers_tx.subscribe()
    }

    pub(crate) fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(strategy = self.name, status = status.as_str(), "Strategy status changed");
        }
    }

    fn publish_peers(&self, records: Vec<StrategyPeerRecord>) {
        self.peers_tx.send_if_modified(|current| {
            if *current == records {
                return false;
            }
            *current = records;
            true
        });
    }

    /// Disconnect anything live, then supervise a new connection. Returns
    /// once the first attempt has either connected or failed.
    pub(crate) async fn start<O: RoomOpener>(
        self: &Arc<Self>,
        room: &str,
        opener: O,
    ) -> Result<(), StrategyError> {
        let bound = self
            .bound
            .lock()
            .clone()
            .ok_or(StrategyError::NotInitialized(self.name))?;
        // Two live links would route the same peer twice.
        self.stop().await;

        let cancel = CancellationToken::new();
        let (first_tx, first_rx) = oneshot::channel();
        self.set_status(ConnectionStatus::Connecting);
        let supervisor = tokio::spawn(
            supervise(
                Arc::clone(self),
                bound,
                room.to_string(),
                opener,
                cancel.clone(),
                first_tx,
            )
            .instrument(spans::strategy(self.name, Some(room))),
        );
        {
            let mut link = self.link.lock();
            link.cancel = Some(cancel);
            link.supervisor = Some(supervisor);
        }
        let _ = first_rx.await;
        Ok(())
    }

    /// Tear down the live link, if any. Idempotent.
    pub(crate) async fn stop(&self) {
        let (cancel, provider, supervisor) = {
            let mut link = self.link.lock();
            (
                link.cancel.take(),
                link.provider.take(),
                link.supervisor.take(),
            )
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        // Leaving the room closes its signaling connection right away.
        if let Some(provider) = provider {
            provider.destroy().await;
        }
        if let Some(supervisor) = supervisor {
            supervisor.abort();
            let _ = supervisor.await;
        }
        self.attributed.lock().clear();
        self.publish_peers(Vec::new());
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub(crate) async fn release(&self) {
        self.stop().await;
        *self.bound.lock() = None;
    }

    /// Publish `provider` as the live one unless the link was cancelled.
    fn install(&self, cancel: &CancellationToken, provider: &Arc<ReplicationProvider>) -> bool {
        let mut link = self.link.lock();
        if cancel.is_cancelled() {
            return false;
        }
        link.provider = Some(Arc::clone(provider));
        true
    }

    async fn uninstall(&self, provider: &Arc<ReplicationProvider>) {
        {
            let mut link = self.link.lock();
            if link
                .provider
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, provider))
            {
                link.provider = None;
            }
        }
        provider.destroy().await;
        self.attributed.lock().clear();
        self.publish_peers(Vec::new());
    }

    /// Follow what this strategy's own provider relays. Removals applied by
    /// another provider say nothing about this transport and are ignored.
    fn attribute(&self, change: &PresenceChange, tag: &ProviderTag) {
        let mut attributed = self.attributed.lock();
        if change.origin.is_from(tag) {
            attributed.extend(
                change
                    .added
                    .iter()
                    .chain(&change.updated)
                    .chain(&change.renewed)
                    .chain(&change.announced)
                    .copied(),
            );
            for id in change.withdrawn.iter().chain(&change.removed) {
                attributed.remove(id);
            }
        } else if change.origin == Origin::Local {
            // Expired locally.
            for id in &change.removed {
                attributed.remove(id);
            }
        }
    }

    /// Adopt session-backed clients event tracking missed. Additive only.
    fn reconcile(&self, provider: &ReplicationProvider, presence: &PresenceTable) {
        let opened = provider.reconcile();
        if !opened.is_empty() {
            debug!(strategy = self.name, peers = ?opened, "Reconciliation opened missed sessions");
        }
        let mut attributed = self.attributed.lock();
        for id in provider.session_clients() {
            if presence.contains(id) && attributed.insert(id) {
                debug!(strategy = self.name, client_id = id, "Reconciliation adopted client");
            }
        }
    }

    fn refresh(&self, provider: &ReplicationProvider, presence: &PresenceTable) {
        let live = provider.session_clients();
        let own = presence.client_id();
        let ids: Vec<ClientId> = {
            let mut attributed = self.attributed.lock();
            // A lost session takes this strategy's attribution with it.
            attributed.retain(|id| live.contains(id));
            attributed.iter().copied().filter(|id| *id != own).collect()
        };
        let mut records: Vec<StrategyPeerRecord> = ids
            .into_iter()
            .filter_map(|id| {
                let state = presence.state(id)?;
                Some(StrategyPeerRecord {
                    client_id: id,
                    name: state_name(&state).unwrap_or_else(|| format!("client-{id}")),
                    ip: state_ip(&state),
                })
            })
            .collect();
        records.sort_by_key(|r| r.client_id);
        self.publish_peers(records);
    }

    async fn track(
        &self,
        provider: &ReplicationProvider,
        presence: &PresenceTable,
        cancel: &CancellationToken,
    ) -> LinkEnd {
        let mut changes = presence.subscribe();
        let mut events = provider.events();
        let room_closed = provider.room().closed();
        let mut reconcile = tokio::time::interval(self.settings.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LinkEnd::Cancelled,
                _ = room_closed.cancelled() => return LinkEnd::Lost,
                change = changes.recv() => match change {
                    Ok(change) => self.attribute(&change, provider.tag()),
                    Err(RecvError::Lagged(_)) => self.reconcile(provider, presence),
                    Err(RecvError::Closed) => return LinkEnd::Cancelled,
                },
                event = events.recv() => match event {
                    Ok(ProviderEvent::Status(ProviderStatus::Disconnected)) | Err(RecvError::Closed) => {
                        return LinkEnd::Lost;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                },
                _ = reconcile.tick() => self.reconcile(provider, presence),
            }
            self.refresh(provider, presence);
        }
    }

    fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            max_peers: self.settings.max_peers,
            local_bus: self.settings.local_bus.clone(),
        }
    }
}

async fn supervise<O: RoomOpener>(
    core: Arc<StrategyCore>,
    bound: Bound,
    room: String,
    opener: O,
    cancel: CancellationToken,
    first: oneshot::Sender<()>,
) {
    let mut first = Some(first);
    let mut backoff = Backoff::new(core.settings.reconnect_base, core.settings.reconnect_max);

    loop {
        core.set_status(ConnectionStatus::Connecting);
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = opener.open(&room) => opened,
        };

        match opened {
            Ok(transport) => {
                let provider = Arc::new(ReplicationProvider::connect(
                    transport,
                    Arc::clone(&bound.replica),
                    Arc::clone(&bound.presence),
                    &room,
                    core.provider_options(),
                ));
                if !core.install(&cancel, &provider) {
                    provider.destroy().await;
                    break;
                }
                backoff.reset();
                core.set_status(ConnectionStatus::Connected);
                if let Some(first) = first.take() {
                    let _ = first.send(());
                }

                if core.track(&provider, &bound.presence, &cancel).await == LinkEnd::Cancelled {
                    break;
                }
                warn!("Transport lost");
                crate::metrics::record_strategy_error(core.name, "transport_lost");
                core.uninstall(&provider).await;
                core.set_status(ConnectionStatus::Error);
            }
            Err(e) => {
                warn!(error = %e, "Connection attempt failed");
                crate::metrics::record_strategy_error(core.name, e.error_code());
                core.set_status(ConnectionStatus::Error);
                if let Some(first) = first.take() {
                    let _ = first.send(());
                }
            }
        }

        let delay = backoff.next_delay();
        crate::metrics::record_reconnect(core.name);
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempts(),
            "Reconnect scheduled"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
