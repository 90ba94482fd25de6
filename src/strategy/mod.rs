//! Connection strategies.
//!
//! A strategy binds one [`ReplicationProvider`](crate::sync::ReplicationProvider)
//! to one concrete transport's join mechanism and exposes a uniform lifecycle.
//! Every strategy implements [`ConnectionStrategy`]; nothing above this layer
//! branches on the transport type.

mod shared;
mod internet;
mod lan;

pub use shared::StrategySettings;
pub use internet::InternetStrategy;
pub use lan::LanStrategy;

use crate::error::StrategyError;
use crate::presence::{ClientId, PresenceTable};
use crate::replica::DocumentReplica;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Canonical id of the LAN strategy.
pub const LOCAL_STRATEGY_ID: &str = "local";
/// Canonical id of the internet strategy.
pub const INTERNET_STRATEGY_ID: &str = "internet";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

/// A peer one strategy can attribute to itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPeerRecord {
    pub client_id: ClientId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Options accepted by [`ConnectionStrategy::connect`].
#[derive(Debug, Clone, Default)]
pub struct StrategyConfig {
    pub enable: bool,
    /// Relay host (LAN).
    pub address: Option<String>,
    /// Relay port (LAN).
    pub port: Option<u16>,
    /// Room passphrase.
    pub secret: Option<String>,
    /// Broker URLs (internet).
    pub discovery_relay_address: Vec<String>,
    pub credentials: Option<String>,
}

/// Uniform lifecycle over any transport.
#[async_trait]
pub trait ConnectionStrategy: Send + Sync + 'static {
    /// Stable id used by the aggregator.
    fn id(&self) -> &str;

    /// Bind the shared replica and presence table. Must precede `connect`.
    fn initialize(&self, replica: Arc<dyn DocumentReplica>, presence: Arc<PresenceTable>);

    /// Join `room`. Calling it while connected first disconnects fully.
    async fn connect(&self, room: &str, config: StrategyConfig) -> Result<(), StrategyError>;

    /// Tear down the connection. Idempotent.
    async fn disconnect(&self);

    /// Disconnect and release the replica and presence table.
    async fn destroy(&self);

    fn is_connected(&self) -> bool;

    fn get_peers(&self) -> Vec<StrategyPeerRecord>;

    /// Latest peer list; changes on every peer update.
    fn peer_updates(&self) -> watch::Receiver<Vec<StrategyPeerRecord>>;

    /// Latest status; changes on every status transition.
    fn status_updates(&self) -> watch::Receiver<ConnectionStatus>;
}
