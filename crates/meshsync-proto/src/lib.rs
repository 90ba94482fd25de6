//! # meshsync-proto
//!
//! Wire formats shared by every meshsync transport:
//!
//! - [`frame`]: Binary peer frames (document sync steps, presence deltas, presence query)
//! - [`relay`]: JSON messages spoken with a local relay (subscribe/publish/ping)
//! - [`beacon`]: JSON datagrams used for LAN host discovery
//! - [`signal`]: JSON room signals (announce/leave/action) and their sealed form
//!
//! The crate has no runtime dependencies; transports live in the `meshsync` crate.

#![deny(clippy::all)]

pub mod beacon;
pub mod error;
pub mod frame;
pub mod relay;
pub mod signal;

pub use self::beacon::{DiscoveryMessage, PeerInfo};
pub use self::error::{ProtocolError, Result};
pub use self::frame::Frame;
pub use self::relay::RelayMessage;
pub use self::signal::{Sealed, Signal};
