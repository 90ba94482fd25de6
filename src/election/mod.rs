//! LAN host election.
//!
//! Devices on one LAN agree on a single relay host: listen for beacons for a
//! window, host when nobody answered, follow the first host otherwise. Two
//! hosts that hear each other resolve deterministically on device id.

mod driver;
mod machine;
mod service;

pub use driver::{LanDriver, LanDriverConfig};
pub use machine::{ConnectTarget, ElectionAction, ElectionMachine, ElectionParams, Role};
pub use service::{ElectionConfig, ElectionDriver, ElectionService};
