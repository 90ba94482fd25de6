//! Client identifiers, hybrid timestamps and state vectors.
//!
//! - `ClientId`: Numeric identifier of one replica (one document instance).
//! - `HybridTimestamp`: Wall clock + logical counter + client id, totally ordered.
//! - `VectorClock`: Highest integrated sequence number per client; doubles as the
//!   document's state vector on the wire.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A unique identifier for a document replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Create a client id from a raw number.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw numeric id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A hybrid logical timestamp for last-writer-wins ordering.
///
/// Combines:
/// - Wall clock time (milliseconds since epoch)
/// - Logical counter (for events within the same millisecond)
/// - Client ID (for tie-breaking)
///
/// Two replicas always agree on the order of any two timestamps.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct HybridTimestamp {
    /// Wall clock time in milliseconds since Unix epoch.
    pub millis: i64,
    /// Logical counter for events within the same millisecond.
    pub counter: u32,
    /// Originating client, used only for tie-breaking.
    pub client: ClientId,
}

impl HybridTimestamp {
    /// Create a new timestamp.
    #[must_use]
    pub fn new(millis: i64, counter: u32, client: ClientId) -> Self {
        Self {
            millis,
            counter,
            client,
        }
    }

    /// The zero timestamp for a client; every real event orders after it.
    #[must_use]
    pub fn zero(client: ClientId) -> Self {
        Self::new(0, 0, client)
    }

    /// Create a timestamp for the current time.
    #[must_use]
    pub fn now(client: ClientId) -> Self {
        Self::new(chrono::Utc::now().timestamp_millis(), 0, client)
    }

    /// Produce the next local timestamp, strictly after `self` and after
    /// every timestamp this replica has observed.
    #[must_use]
    pub fn tick(&self) -> Self {
        self.tick_at(chrono::Utc::now().timestamp_millis())
    }

    /// Same as [`tick`](Self::tick) with an explicit wall clock reading.
    #[must_use]
    pub fn tick_at(&self, now_millis: i64) -> Self {
        if now_millis > self.millis {
            Self::new(now_millis, 0, self.client)
        } else {
            Self::new(self.millis, self.counter.saturating_add(1), self.client)
        }
    }

    /// Fold a remote timestamp into the local clock so later local events
    /// order after it.
    #[must_use]
    pub fn observe(&self, remote: &Self) -> Self {
        match self.millis.cmp(&remote.millis) {
            Ordering::Greater => *self,
            Ordering::Less => Self::new(remote.millis, remote.counter, self.client),
            Ordering::Equal => Self::new(self.millis, self.counter.max(remote.counter), self.client),
        }
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then(self.counter.cmp(&other.counter))
            .then(self.client.cmp(&other.client))
    }
}

/// A vector clock mapping each client to the highest sequence number
/// integrated from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: HashMap<u64, u64>,
}

impl VectorClock {
    /// Create a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current counter for a client.
    #[must_use]
    pub fn get(&self, client: ClientId) -> u64 {
        self.entries.get(&client.0).copied().unwrap_or(0)
    }

    /// Set the counter for a client.
    pub fn set(&mut self, client: ClientId, seq: u64) {
        self.entries.insert(client.0, seq);
    }

    /// Increment the counter for a client, returning the new value.
    pub fn increment(&mut self, client: ClientId) -> u64 {
        let entry = self.entries.entry(client.0).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Update to include all events from another clock.
    pub fn merge(&mut self, other: &Self) {
        for (client, &counter) in &other.entries {
            let entry = self.entries.entry(*client).or_insert(0);
            *entry = (*entry).max(counter);
        }
    }

    /// Iterate over `(client, seq)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.entries.iter().map(|(c, s)| (ClientId(*c), *s))
    }

    /// Compare causally.
    ///
    /// Returns `None` when the clocks are concurrent.
    #[must_use]
    pub fn partial_cmp_causal(&self, other: &Self) -> Option<Ordering> {
        let mut self_greater = false;
        let mut other_greater = false;

        let all: std::collections::HashSet<_> =
            self.entries.keys().chain(other.entries.keys()).collect();

        for client in all {
            let a = self.entries.get(client).copied().unwrap_or(0);
            let b = other.entries.get(client).copied().unwrap_or(0);
            if a > b {
                self_greater = true;
            } else if b > a {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (true, true) => None,
        }
    }

    /// Check whether this clock already covers everything in `other`.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.partial_cmp_causal(other),
            Some(Ordering::Greater | Ordering::Equal)
        )
    }
}
