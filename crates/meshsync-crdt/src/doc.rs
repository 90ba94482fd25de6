//! Op-log backed last-writer-wins key/value document.
//!
//! Every local write becomes an [`Op`] identified by `(client, seq)`. The
//! document's state vector is the highest contiguous `seq` integrated per
//! client, so a peer can ask for exactly the ops it lacks. Ops arriving with a
//! gap are parked until the gap is filled; duplicates are discarded.

use crate::clock::{ClientId, HybridTimestamp, VectorClock};
use crate::traits::LwwRegister;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Upper bound on parked out-of-order ops before the oldest are dropped.
const PENDING_MAX: usize = 10_000;

/// Errors produced while decoding updates or state vectors.
#[derive(Debug, Error)]
pub enum DocError {
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("failed to encode: {0}")]
    Encode(String),
}

/// A single write to the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub client: ClientId,
    pub seq: u64,
    pub ts: HybridTimestamp,
    pub key: String,
    /// `None` deletes the key.
    pub value: Option<Value>,
}

/// A batch of ops, the unit exchanged between replicas.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Serialize to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, DocError> {
        rmp_serde::to_vec(self).map_err(|e| DocError::Encode(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DocError> {
        rmp_serde::from_slice(bytes).map_err(|e| DocError::MalformedUpdate(e.to_string()))
    }
}

/// Encode a state vector for the wire.
pub fn encode_state_vector(sv: &VectorClock) -> Result<Vec<u8>, DocError> {
    rmp_serde::to_vec(sv).map_err(|e| DocError::Encode(e.to_string()))
}

/// Decode a state vector from the wire.
pub fn decode_state_vector(bytes: &[u8]) -> Result<VectorClock, DocError> {
    rmp_serde::from_slice(bytes).map_err(|e| DocError::MalformedStateVector(e.to_string()))
}

/// A replicated LWW map from string keys to JSON values.
#[derive(Debug, Clone)]
pub struct LwwDocument {
    client: ClientId,
    clock: HybridTimestamp,
    state_vector: VectorClock,
    /// Integrated ops per client, index `seq - 1`.
    log: HashMap<ClientId, Vec<Op>>,
    /// Ops waiting for a missing predecessor, keyed by `(client, seq)`.
    pending: BTreeMap<(ClientId, u64), Op>,
    entries: HashMap<String, LwwRegister<Option<Value>>>,
}

impl LwwDocument {
    /// Create an empty document owned by `client`.
    #[must_use]
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            clock: HybridTimestamp::zero(client),
            state_vector: VectorClock::new(),
            log: HashMap::new(),
            pending: BTreeMap::new(),
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Current state vector.
    #[must_use]
    pub fn state_vector(&self) -> &VectorClock {
        &self.state_vector
    }

    /// Read a key. Deleted and absent keys both read as `None`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).and_then(|r| r.value().as_ref())
    }

    /// Keys with a live value, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, r)| r.value().is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Snapshot of all live values as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map = self
            .entries
            .iter()
            .filter_map(|(k, r)| r.value().clone().map(|v| (k.clone(), v)))
            .collect::<serde_json::Map<_, _>>();
        Value::Object(map)
    }

    /// Write a key locally, returning the update to replicate.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Update {
        self.local_op(key.into(), Some(value))
    }

    /// Delete a key locally, returning the update to replicate.
    pub fn delete(&mut self, key: impl Into<String>) -> Update {
        self.local_op(key.into(), None)
    }

    fn local_op(&mut self, key: String, value: Option<Value>) -> Update {
        self.clock = self.clock.tick();
        let seq = self.state_vector.get(self.client) + 1;
        let op = Op {
            client: self.client,
            seq,
            ts: self.clock,
            key,
            value,
        };
        self.integrate(op.clone());
        Update { ops: vec![op] }
    }

    /// Every integrated op the holder of `since` lacks. `None` means
    /// everything.
    #[must_use]
    pub fn diff(&self, since: Option<&VectorClock>) -> Update {
        let mut ops = Vec::new();
        for (client, log) in &self.log {
            let have = since.map_or(0, |sv| sv.get(*client)) as usize;
            if have < log.len() {
                ops.extend(log[have..].iter().cloned());
            }
        }
        ops.sort_by_key(|op| (op.client, op.seq));
        Update { ops }
    }

    /// Apply a remote update. Returns the ops that were newly integrated,
    /// in integration order; duplicates and still-blocked ops are excluded.
    pub fn apply(&mut self, update: Update) -> Update {
        for op in update.ops {
            if op.seq <= self.state_vector.get(op.client) {
                continue;
            }
            self.pending.insert((op.client, op.seq), op);
        }

        let mut applied = Vec::new();
        loop {
            let ready: Vec<(ClientId, u64)> = self
                .pending
                .keys()
                .filter(|(client, seq)| *seq == self.state_vector.get(*client) + 1)
                .copied()
                .collect();
            if ready.is_empty() {
                break;
            }
            for key in ready {
                if let Some(op) = self.pending.remove(&key) {
                    self.clock = self.clock.observe(&op.ts);
                    applied.push(op.clone());
                    self.integrate(op);
                }
            }
        }

        while self.pending.len() > PENDING_MAX {
            self.pending.pop_first();
        }

        Update { ops: applied }
    }

    /// Number of ops parked behind a gap.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn integrate(&mut self, op: Op) {
        self.state_vector.set(op.client, op.seq);
        match self.entries.get_mut(&op.key) {
            Some(reg) => {
                reg.update(op.value.clone(), op.ts);
            }
            None => {
                self.entries
                    .insert(op.key.clone(), LwwRegister::new(op.value.clone(), op.ts));
            }
        }
        self.log.entry(op.client).or_default().push(op);
    }
}
