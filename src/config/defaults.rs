//! Default value functions for configuration.
//!
//! Separated into its own module for clarity and reuse.

use std::net::Ipv4Addr;

/// Returns `true` (for serde defaults).
pub fn default_true() -> bool {
    true
}

// =============================================================================
// Device Defaults
// =============================================================================

pub fn default_device_id() -> String {
    let id = uuid::Uuid::new_v4().to_string();
    tracing::warn!(
        device_id = %id,
        "No device.id configured - using an ephemeral id. \
         Split-brain resolution stays deterministic, but the winner may \
         change across restarts. Set [device].id for stable hosting."
    );
    id
}

pub fn default_device_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "meshsync".to_string())
}

// =============================================================================
// Room Defaults
// =============================================================================

pub fn default_max_peers() -> usize {
    20
}

// =============================================================================
// LAN Defaults
// =============================================================================

pub fn default_relay_port() -> u16 {
    4444
}

pub fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 42, 99)
}

pub fn default_discovery_port() -> u16 {
    4445
}

pub fn default_beacon_interval_ms() -> u64 {
    2000
}

pub fn default_peer_timeout_ms() -> u64 {
    6000
}

pub fn default_election_window_ms() -> u64 {
    3000
}

pub fn default_reconnect_base_ms() -> u64 {
    1000
}

pub fn default_reconnect_max_ms() -> u64 {
    30_000
}

// =============================================================================
// Presence Defaults
// =============================================================================

pub fn default_outdated_timeout_ms() -> u64 {
    30_000
}

pub fn default_renew_interval_ms() -> u64 {
    15_000
}
