//! Conflict-free Replicated Data Types for the meshsync shared document.
//!
//! The replication core treats the document as an opaque replica with four
//! operations: read the state vector, encode a diff against a state vector,
//! apply an update, and observe changes. This crate supplies a concrete
//! replica with those properties.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              LwwDocument                 │
//! │  ┌──────────────┐   ┌─────────────────┐  │
//! │  │  op log      │   │  LWW registers  │  │
//! │  │ (client,seq) │──▶│  key -> value   │  │
//! │  └──────────────┘   └─────────────────┘  │
//! │          │                               │
//! │          ▼                               │
//! │   VectorClock (state vector)             │
//! └──────────────────────────────────────────┘
//! ```
//!
//! # CRDT Types Used
//!
//! - **LWW (Last-Writer-Wins)**: Each key resolves to the value carried by the
//!   op with the greatest [`HybridTimestamp`].
//! - **Vector Clock**: Summarises which ops a replica already integrated so
//!   peers exchange minimal diffs.

pub mod clock;
pub mod doc;
pub mod traits;

pub use clock::{ClientId, HybridTimestamp, VectorClock};
pub use doc::{DocError, LwwDocument, Op, Update, decode_state_vector, encode_state_vector};
pub use traits::{Crdt, LwwRegister, Mergeable};
