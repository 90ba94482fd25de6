//! Integration test common infrastructure.
//!
//! In-process devices that share one replica and presence table across an
//! internet strategy (over a [`MemoryBroker`]) and a LAN strategy (over a
//! real [`RelayServer`] on loopback).

#![allow(dead_code)]

use meshsync::aggregator::{AggregatorPolicy, PeerSource, StrategyAggregator};
use meshsync::presence::{ClientId, PresenceTable};
use meshsync::relay::RelayServer;
use meshsync::replica::SharedDocument;
use meshsync::room::{MemoryBroker, WsConnector};
use meshsync::strategy::{
    ConnectionStrategy, InternetStrategy, LanStrategy, StrategyConfig, StrategySettings,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const BROKER: &str = "wss://broker.test";
pub const ROOM: &str = "notes";

pub fn fast_settings() -> StrategySettings {
    StrategySettings {
        heartbeat: Duration::from_millis(200),
        peer_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(20),
        reconnect_max: Duration::from_millis(200),
        reconcile_interval: Duration::from_millis(100),
        ..StrategySettings::default()
    }
}

pub fn internet_config(secret: Option<&str>) -> StrategyConfig {
    StrategyConfig {
        enable: true,
        discovery_relay_address: vec![BROKER.to_string()],
        secret: secret.map(str::to_string),
        ..StrategyConfig::default()
    }
}

pub fn lan_config(relay: SocketAddr) -> StrategyConfig {
    StrategyConfig {
        enable: true,
        address: Some(relay.ip().to_string()),
        port: Some(relay.port()),
        ..StrategyConfig::default()
    }
}

pub async fn start_relay() -> RelayServer {
    RelayServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("relay bind")
}

/// Poll `cond` until it holds, panicking after ten seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for: {what}");
}

/// One device: shared replica and presence, both strategies, an aggregator.
pub struct TestDevice {
    pub client_id: ClientId,
    pub doc: Arc<SharedDocument>,
    pub presence: Arc<PresenceTable>,
    pub internet: Arc<InternetStrategy>,
    pub lan: Arc<LanStrategy>,
    pub aggregator: Arc<StrategyAggregator>,
}

impl TestDevice {
    pub fn new(broker: &MemoryBroker, client_id: ClientId, name: &str) -> Self {
        Self::with_settings(broker, client_id, name, fast_settings())
    }

    pub fn with_settings(
        broker: &MemoryBroker,
        client_id: ClientId,
        name: &str,
        settings: StrategySettings,
    ) -> Self {
        let doc = Arc::new(SharedDocument::new(client_id));
        let presence = Arc::new(PresenceTable::new(client_id));
        presence.set_local_state(Some(json!({"user": {"name": name, "ip": "127.0.0.1"}})));

        let internet = Arc::new(InternetStrategy::new(
            Arc::new(broker.clone()),
            settings.clone(),
        ));
        let lan = Arc::new(LanStrategy::new(
            Arc::new(WsConnector::default()),
            settings,
        ));
        internet.initialize(doc.clone(), presence.clone());
        lan.initialize(doc.clone(), presence.clone());

        let aggregator = StrategyAggregator::new(AggregatorPolicy::default());
        aggregator.register(internet.as_ref());
        aggregator.register(lan.as_ref());

        Self {
            client_id,
            doc,
            presence,
            internet,
            lan,
            aggregator,
        }
    }

    pub async fn join_internet(&self, secret: Option<&str>) {
        self.internet
            .connect(ROOM, internet_config(secret))
            .await
            .expect("internet connect");
    }

    pub async fn join_lan(&self, relay: &RelayServer) {
        self.lan
            .connect(ROOM, lan_config(relay.local_addr()))
            .await
            .expect("lan connect");
    }

    /// Aggregated source of `client_id`, if listed.
    pub fn source_of(&self, client_id: ClientId) -> Option<PeerSource> {
        self.aggregator
            .peers()
            .into_iter()
            .find(|p| p.client_id == client_id)
            .map(|p| p.source)
    }

    pub async fn destroy(&self) {
        self.internet.destroy().await;
        self.lan.destroy().await;
        self.aggregator.shutdown();
    }
}
