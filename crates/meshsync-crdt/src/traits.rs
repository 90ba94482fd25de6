//! Core CRDT traits and the last-writer-wins register.

use crate::clock::HybridTimestamp;

/// A Conflict-free Replicated Data Type.
///
/// Merge must be commutative, associative and idempotent so replicas converge
/// regardless of delivery order or duplication.
pub trait Crdt: Sized {
    /// Merge another instance into this one.
    fn merge(&mut self, other: &Self);

    /// Returns `true` if merging `other` into `self` would not change `self`.
    fn dominates(&self, other: &Self) -> bool;
}

/// A value with an associated timestamp for Last-Writer-Wins semantics.
pub trait Mergeable: Clone {
    /// Get the timestamp of this value.
    fn timestamp(&self) -> HybridTimestamp;

    /// Merge with another value, returning the winner.
    #[must_use]
    fn merge_with(&self, other: &Self) -> Self {
        if other.timestamp() > self.timestamp() {
            other.clone()
        } else {
            self.clone()
        }
    }
}

/// A Last-Writer-Wins register.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    timestamp: HybridTimestamp,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a new LWW register with the given value and timestamp.
    pub fn new(value: T, timestamp: HybridTimestamp) -> Self {
        Self { value, timestamp }
    }

    /// Get the current value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Get the timestamp.
    pub fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }

    /// Update the value if the new timestamp is greater. Returns whether
    /// the register changed.
    pub fn update(&mut self, value: T, timestamp: HybridTimestamp) -> bool {
        if timestamp > self.timestamp {
            self.value = value;
            self.timestamp = timestamp;
            true
        } else {
            false
        }
    }
}

impl<T: Clone> Mergeable for LwwRegister<T> {
    fn timestamp(&self) -> HybridTimestamp {
        self.timestamp
    }
}

impl<T: Clone> Crdt for LwwRegister<T> {
    fn merge(&mut self, other: &Self) {
        if other.timestamp > self.timestamp {
            self.value = other.value.clone();
            self.timestamp = other.timestamp;
        }
    }

    fn dominates(&self, other: &Self) -> bool {
        self.timestamp >= other.timestamp
    }
}
