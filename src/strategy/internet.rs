//! Internet strategy: rooms over public signaling brokers.

use super::shared::{RoomOpener, StrategyCore, StrategySettings, derive_key, join_topic};
use super::{
    ConnectionStatus, ConnectionStrategy, INTERNET_STRATEGY_ID, StrategyConfig, StrategyPeerRecord,
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

struct BrokerOpener {
    connector: Arc<dyn SignalingConnector>,
    urls: Vec<String>,
    key: Option<Arc<RoomKey>>,
    settings: StrategySettings,
}

#[async_trait]
impl RoomOpener for BrokerOpener {
    /// First broker that accepts the connection wins.
    async fn open(&self, room: &str) -> Result<Arc<dyn Room>, StrategyError> {
        let mut last = RoomError::Unreachable("no broker configured".into());
        for url in &self.urls {
            match self.connector.connect(url).await {
                Ok(signaling) => {
                    debug!(url = %url, "Broker connected");
                    return join_topic(signaling, room, self.key.clone(), &self.settings);
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Broker unreachable");
                    last = e;
                }
            }
        }
        Err(last.into())
    }
}

/// Joins rooms through the configured signaling brokers.
pub struct InternetStrategy {
    core: Arc<StrategyCore>,
    connector: Arc<dyn SignalingConnector>,
}

impl std::fmt::Debug for InternetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternetStrategy")
            .field("status", &self.core.status())
            .finish()
    }
}

impl InternetStrategy {
    pub fn new(connector: Arc<dyn SignalingConnector>, settings: StrategySettings) -> Self {
        Self {
            core: StrategyCore::new(INTERNET_STRATEGY_ID, settings),
            connector,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.core.status()
    }
}

#[async_trait]
impl ConnectionStrategy for InternetStrategy {
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
            return Err(StrategyError::Disabled(INTERNET_STRATEGY_ID));
        }
        if config.discovery_relay_address.is_empty() {
            return Err(StrategyError::NoAddress(INTERNET_STRATEGY_ID));
        }
        let key = derive_key(config.secret.as_deref(), room).await?;
        let opener = BrokerOpener {
            connector: Arc::clone(&self.connector),
            urls: config.discovery_relay_address,
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
