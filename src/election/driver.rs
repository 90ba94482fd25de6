//! Election driver over real sockets: multicast discovery, the websocket
//! relay and the LAN strategy.

use super::machine::ConnectTarget;
use super::service::ElectionDriver;
use crate::discovery::{BeaconEvent, Discovery, DiscoveryConfig};
use crate::error::ElectionError;
use crate::relay::RelayServer;
use crate::strategy::{ConnectionStrategy, StrategyConfig};
use async_trait::async_trait;
use meshsync_proto::PeerInfo;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LanDriverConfig {
    pub room: String,
    /// Base options for every LAN connect; address and port are filled in.
    pub strategy: StrategyConfig,
    pub discovery: DiscoveryConfig,
    /// Port the hosted relay binds. Zero picks a free one.
    pub relay_port: u16,
    pub beacon_interval: Duration,
    /// Identity announced in beacons; `port` follows the bound relay.
    pub info: PeerInfo,
}

pub struct LanDriver {
    config: LanDriverConfig,
    strategy: Arc<dyn ConnectionStrategy>,
    discovery: Mutex<Option<Discovery>>,
    relay: Mutex<Option<RelayServer>>,
    info: Mutex<PeerInfo>,
}

impl std::fmt::Debug for LanDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanDriver")
            .field("room", &self.config.room)
            .field("relay", &self.relay_addr())
            .finish()
    }
}

impl LanDriver {
    pub fn new(config: LanDriverConfig, strategy: Arc<dyn ConnectionStrategy>) -> Self {
        let info = config.info.clone();
        Self {
            config,
            strategy,
            discovery: Mutex::new(None),
            relay: Mutex::new(None),
            info: Mutex::new(info),
        }
    }

    /// Address of the hosted relay, if running.
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay.lock().as_ref().map(RelayServer::local_addr)
    }

    fn target_config(&self, address: String, port: u16) -> StrategyConfig {
        StrategyConfig {
            enable: true,
            address: Some(address),
            port: Some(port),
            ..self.config.strategy.clone()
        }
    }
}

#[async_trait]
impl ElectionDriver for LanDriver {
    async fn listen(&self) -> Result<broadcast::Receiver<BeaconEvent>, ElectionError> {
        if let Some(old) = self.discovery.lock().take() {
            old.stop();
        }
        let discovery = Discovery::start(self.config.discovery.clone())?;
        let events = discovery.events();
        *self.discovery.lock() = Some(discovery);
        Ok(events)
    }

    async fn start_relay(&self) -> Result<(), ElectionError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.relay_port));
        let relay = RelayServer::bind(addr)
            .await
            .map_err(|e| ElectionError::RelayStart(e.to_string()))?;
        self.info.lock().port = relay.local_addr().port();
        info!(addr = %relay.local_addr(), "Hosting LAN relay");
        if let Some(old) = self.relay.lock().replace(relay) {
            old.shutdown();
        }
        Ok(())
    }

    async fn stop_relay(&self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.shutdown();
        }
    }

    async fn start_beacon(&self) {
        let info = self.info.lock().clone();
        match self.discovery.lock().as_ref() {
            Some(discovery) => discovery.start_beacon(info, self.config.beacon_interval),
            None => warn!("Cannot beacon without a discovery socket"),
        }
    }

    async fn stop_beacon(&self) {
        if let Some(discovery) = self.discovery.lock().as_ref() {
            discovery.stop_beacon();
        }
    }

    async fn connect(&self, target: ConnectTarget) -> Result<(), ElectionError> {
        let config = match target {
            ConnectTarget::OwnRelay => {
                let Some(addr) = self.relay_addr() else {
                    return Err(ElectionError::RelayStart("relay not running".into()));
                };
                self.target_config(Ipv4Addr::LOCALHOST.to_string(), addr.port())
            }
            ConnectTarget::Host(host) => self.target_config(host.ip, host.port),
            ConnectTarget::Configured { address, port } => self.target_config(address, port),
        };
        self.strategy.connect(&self.config.room, config).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.strategy.disconnect().await;
    }
}

impl Drop for LanDriver {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.get_mut().take() {
            relay.shutdown();
        }
        if let Some(discovery) = self.discovery.get_mut().take() {
            discovery.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceTable;
    use crate::replica::SharedDocument;
    use crate::room::WsConnector;
    use crate::strategy::{LanStrategy, StrategySettings};

    fn driver() -> (LanDriver, Arc<LanStrategy>) {
        let strategy = Arc::new(LanStrategy::new(
            Arc::new(WsConnector::default()),
            StrategySettings::default(),
        ));
        strategy.initialize(
            Arc::new(SharedDocument::new(1)),
            Arc::new(PresenceTable::new(1)),
        );
        let config = LanDriverConfig {
            room: "notes".into(),
            strategy: StrategyConfig::default(),
            discovery: DiscoveryConfig {
                device_id: "aaa".into(),
                multicast_group: Ipv4Addr::new(239, 255, 77, 77),
                port: 0,
            },
            relay_port: 0,
            beacon_interval: Duration::from_secs(2),
            info: PeerInfo {
                device_id: "aaa".into(),
                name: "desk".into(),
                ip: "127.0.0.1".into(),
                port: 0,
            },
        };
        (LanDriver::new(config, strategy.clone()), strategy)
    }

    #[tokio::test]
    async fn test_hosting_connects_to_own_relay() {
        let (driver, strategy) = driver();
        driver.start_relay().await.unwrap();
        let addr = driver.relay_addr().unwrap();
        assert_eq!(driver.info.lock().port, addr.port());

        driver.connect(ConnectTarget::OwnRelay).await.unwrap();
        assert!(strategy.is_connected());

        driver.disconnect().await;
        driver.stop_relay().await;
        assert!(driver.relay_addr().is_none());
        assert!(!strategy.is_connected());
    }

    #[tokio::test]
    async fn test_own_relay_requires_running_relay() {
        let (driver, _) = driver();
        let err = driver.connect(ConnectTarget::OwnRelay).await.unwrap_err();
        assert!(matches!(err, ElectionError::RelayStart(_)));
    }
}
