//! LAN strategy: rooms over the elected local relay.
//!
//! Every attempt is preceded by a TCP reachability probe of the relay; a
//! failed probe counts as a transport fault and is retried with backoff.

use super::shared::{RoomOpener, StrategyCore, StrategySettings, derive_key, join_topic};
use super::{
    ConnectionStatus, ConnectionStrategy, LOCAL_STRATEGY_ID, StrategyConfig, StrategyPeerRecord,
};
use crate::crypto::RoomKey;
use crate::error::{RoomError, StrategyError};
use crate::presence::PresenceTable;
use crate::replica::DocumentReplica;
use crate::room::{Room, SignalingConnector};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

struct RelayOpener {
    connector: Arc<dyn SignalingConnector>,
    host: String,
    port: u16,
    key: Option<Arc<RoomKey>>,
    settings: StrategySettings,
}

#[async_trait]
impl RoomOpener for RelayOpener {
    async fn open(&self, room: &str) -> Result<Arc<dyn Room>, StrategyError> {
        if !crate::probe::probe_host(&self.host, self.port).await {
            return Err(RoomError::Unreachable(format!("{}:{}", self.host, self.port)).into());
        }
        let url = format!("ws://{}:{}", self.host, self.port);
        debug!(url = %url, "Relay reachable");
        let signaling = self.connector.connect(&url).await?;
        join_topic(signaling, room, self.key.clone(), &self.settings)
    }
}

/// Joins rooms through a relay on the local network.
pub struct LanStrategy {
    core: Arc<StrategyCore>,
    connector: Arc<dyn SignalingConnector>,
}

impl std::fmt::Debug for LanStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanStrategy")
            .field("status", &self.core.status())
            .finish()
    }
}

impl LanStrategy {
    pub fn new(connector: Arc<dyn SignalingConnector>, settings: StrategySettings) -> Self {
        Self {
            core: StrategyCore::new(LOCAL_STRATEGY_ID, settings),
            connector,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.status()
    }
}

#[async_trait]
impl ConnectionStrategy for LanStrategy {
    fn id(&self) -> &str {
        self.core.name()
    }

    fn initialize(&self, replica: Arc<dyn DocumentReplica>, presence: Arc<PresenceTable>) {
        self.core.bind(replica, presence);
    }

    async fn connect(&self, room: &str, config: StrategyConfig) -> Result<(), StrategyError> {
        self.core.ensure_initialized()?;
        if !config.enable {
            self.core.stop().await;
            return Err(StrategyError::Disabled(LOCAL_STRATEGY_ID));
        }
        let (Some(host), Some(port)) = (config.address, config.port) else {
            return Err(StrategyError::NoAddress(LOCAL_STRATEGY_ID));
        };
        let key = derive_key(config.secret.as_deref(), room).await?;
        let opener = RelayOpener {
            connector: Arc::clone(&self.connector),
            host,
            port,
            key,
            settings: self.core.settings().clone(),
        };
        self.core.start(room, opener).await
    }

    async fn disconnect(&self) {
        self.core.stop().await;
    }

    async fn destroy(&self) {
        self.core.release().await;
    }

    fn is_connected(&self) -> bool {
        self.core.status() == ConnectionStatus::Connected
    }

    fn get_peers(&self) -> Vec<StrategyPeerRecord> {
        self.core.peers()
    }

    fn peer_updates(&self) -> watch::Receiver<Vec<StrategyPeerRecord>> {
        self.core.peer_updates()
    }

    fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.core.status_updates()
    }
}
