//! Core configuration types.

use super::defaults::*;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Room every strategy joins.
    pub room: RoomConfig,
    /// Internet strategy (signaling brokers).
    #[serde(default)]
    pub internet: InternetConfig,
    /// LAN strategy, discovery and election.
    #[serde(default)]
    pub lan: LanConfig,
    /// Presence liveness.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Prometheus/HTTP endpoint.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier; the lower id wins a split brain.
    #[serde(default = "default_device_id")]
    pub id: String,
    /// Display name carried in presence and beacons.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Whether this platform may run the local relay.
    #[serde(default = "default_true")]
    pub can_host: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: default_device_id(),
            name: default_device_name(),
            can_host: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomConfig {
    pub name: String,
    /// Passphrase; when set every signal is encrypted.
    #[serde(default)]
    pub secret: Option<String>,
    /// Sessions beyond this count are refused.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Relay to co-located replicas in this process.
    #[serde(default = "default_true")]
    pub broadcast_local: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InternetConfig {
    #[serde(default)]
    pub enable: bool,
    /// Broker URLs, tried in order.
    #[serde(default)]
    pub discovery_relay_address: Vec<String>,
    #[serde(default)]
    pub credentials: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Pre-configured relay host.
    #[serde(default)]
    pub address: Option<String>,
    /// Pre-configured relay port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Port the relay binds when this device hosts.
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_beacon_interval_ms")]
    pub beacon_interval_ms: u64,
    /// Host heartbeat timeout.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_election_window_ms")]
    pub election_window_ms: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enable: true,
            address: None,
            port: None,
            relay_port: default_relay_port(),
            multicast_group: default_multicast_group(),
            discovery_port: default_discovery_port(),
            beacon_interval_ms: default_beacon_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            election_window_ms: default_election_window_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl LanConfig {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    /// Pre-configured relay, when both halves are set.
    pub fn configured_relay(&self) -> Option<(String, u16)> {
        Some((self.address.clone()?, self.port?))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// Remote entries silent for this long are dropped.
    #[serde(default = "default_outdated_timeout_ms")]
    pub outdated_timeout_ms: u64,
    /// The local entry is re-published this often.
    #[serde(default = "default_renew_interval_ms")]
    pub renew_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            outdated_timeout_ms: default_outdated_timeout_ms(),
            renew_interval_ms: default_renew_interval_ms(),
        }
    }
}

impl PresenceConfig {
    pub fn outdated_timeout(&self) -> Duration {
        Duration::from_millis(self.outdated_timeout_ms)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// HTTP port for `/metrics`, `/peers` and `/status`. 0 disables it.
    #[serde(default)]
    pub port: u16,
}
