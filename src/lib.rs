//! meshsync - multi-transport replication of a CRDT document and presence.
//!
//! One document replica and one presence table are shared by every
//! connection strategy. The LAN strategy elects a relay host on the local
//! network; the internet strategy joins through signaling brokers. Their
//! peer lists are merged by the [`aggregator`].

pub mod aggregator;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod election;
pub mod error;
pub mod http;
pub mod metrics;
pub mod origin;
pub mod presence;
pub mod probe;
pub mod relay;
pub mod replica;
pub mod room;
pub mod strategy;
pub mod sync;
pub mod telemetry;

pub use aggregator::{AggregatedPeer, AggregatorPolicy, PeerSource, StrategyAggregator};
pub use config::Config;
pub use presence::{ClientId, PresenceTable};
pub use replica::{DocumentReplica, SharedDocument};
pub use strategy::{ConnectionStatus, ConnectionStrategy, InternetStrategy, LanStrategy};
