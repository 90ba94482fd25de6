//! Configuration validation.
//!
//! Validates configuration at startup to catch common errors early.

use super::Config;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Validation errors for configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("room.name is required")]
    MissingRoomName,
    #[error("device.id must not be empty")]
    EmptyDeviceId,
    #[error("room.max_peers must be at least 1")]
    ZeroMaxPeers,
    #[error("neither [internet] nor [lan] is enabled")]
    NoStrategyEnabled,
    #[error("internet.enable requires at least one discovery_relay_address")]
    MissingBrokers,
    #[error("broker address must be a ws:// or wss:// URL, got '{0}'")]
    InvalidBrokerUrl(String),
    #[error("lan.address and lan.port must be set together")]
    IncompleteRelayAddress,
    #[error("lan.multicast_group {0} is not a multicast address")]
    NotMulticast(Ipv4Addr),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("lan.peer_timeout_ms ({timeout}) must exceed lan.beacon_interval_ms ({interval})")]
    HeartbeatTooShort { timeout: u64, interval: u64 },
    #[error("lan.reconnect_base_ms ({base}) must not exceed lan.reconnect_max_ms ({max})")]
    ReconnectBounds { base: u64, max: u64 },
    #[error(
        "presence.outdated_timeout_ms ({timeout}) must exceed presence.renew_interval_ms ({interval})"
    )]
    PresenceTimeoutTooShort { timeout: u64, interval: u64 },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // Required fields
    if config.room.name.trim().is_empty() {
        errors.push(ValidationError::MissingRoomName);
    }
    if config.device.id.trim().is_empty() {
        errors.push(ValidationError::EmptyDeviceId);
    }
    if config.room.max_peers == 0 {
        errors.push(ValidationError::ZeroMaxPeers);
    }
    if !config.internet.enable && !config.lan.enable {
        errors.push(ValidationError::NoStrategyEnabled);
    }

    // Internet
    if config.internet.enable && config.internet.discovery_relay_address.is_empty() {
        errors.push(ValidationError::MissingBrokers);
    }
    for url in &config.internet.discovery_relay_address {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            errors.push(ValidationError::InvalidBrokerUrl(url.clone()));
        }
    }

    // LAN
    let lan = &config.lan;
    if lan.address.is_some() != lan.port.is_some() {
        errors.push(ValidationError::IncompleteRelayAddress);
    }
    if !lan.multicast_group.is_multicast() {
        errors.push(ValidationError::NotMulticast(lan.multicast_group));
    }
    for (name, value) in [
        ("lan.beacon_interval_ms", lan.beacon_interval_ms),
        ("lan.election_window_ms", lan.election_window_ms),
        ("lan.reconnect_base_ms", lan.reconnect_base_ms),
        ("presence.renew_interval_ms", config.presence.renew_interval_ms),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroDuration(name));
        }
    }
    if lan.peer_timeout_ms <= lan.beacon_interval_ms {
        errors.push(ValidationError::HeartbeatTooShort {
            timeout: lan.peer_timeout_ms,
            interval: lan.beacon_interval_ms,
        });
    }
    if lan.reconnect_base_ms > lan.reconnect_max_ms {
        errors.push(ValidationError::ReconnectBounds {
            base: lan.reconnect_base_ms,
            max: lan.reconnect_max_ms,
        });
    }

    // Presence
    let presence = &config.presence;
    if presence.outdated_timeout_ms <= presence.renew_interval_ms {
        errors.push(ValidationError::PresenceTimeoutTooShort {
            timeout: presence.outdated_timeout_ms,
            interval: presence.renew_interval_ms,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
