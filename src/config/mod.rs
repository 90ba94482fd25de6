//! Configuration loading and management.
//!
//! This module is split into logical submodules:
//! - [`types`]: Config struct definitions, one per TOML section
//! - [`defaults`]: serde default functions
//! - [`validation`]: startup checks returning every problem found

pub mod defaults;
mod types;
mod validation;

pub use types::{
    Config, ConfigError, DeviceConfig, InternetConfig, LanConfig, MetricsConfig, PresenceConfig,
    RoomConfig,
};
pub use validation::{ValidationError, validate};
