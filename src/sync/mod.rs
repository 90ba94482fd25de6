//! Sync Module - document and presence replication over a room.
//!
//! A [`ReplicationProvider`] owns one [`PeerSession`] per remote participant
//! and multiplexes document updates and presence deltas over the room's
//! ordered per-peer channel. Co-located replicas can additionally be linked
//! through a [`LocalBus`].

mod local_bus;
mod provider;
mod session;

pub use local_bus::{BusMessage, LocalBus, LocalBusHandle};
pub use provider::{ProviderEvent, ProviderOptions, ProviderStatus, ReplicationProvider, SYNC_TAG};
pub use session::{PeerSession, SessionState};
