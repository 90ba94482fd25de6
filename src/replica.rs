//! Document replica seam.
//!
//! The replication core never looks inside the shared document. It only needs
//! the state vector, a diff against a remote state vector, update application
//! and a change feed. [`SharedDocument`] is the concrete replica backed by the
//! LWW document from `meshsync-crdt`.

use crate::error::SyncError;
use crate::origin::Origin;
use bytes::Bytes;
use meshsync_crdt::{ClientId, LwwDocument, Update, decode_state_vector, encode_state_vector};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_SIZE: usize = 1024;

/// An applied document change and who produced it.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub update: Bytes,
    pub origin: Origin,
}

/// Opaque replica operations used by the replication core.
pub trait DocumentReplica: Send + Sync + 'static {
    /// Encoded state vector of everything integrated so far.
    fn state_vector(&self) -> Result<Bytes, SyncError>;

    /// Encoded diff of everything not covered by `since` (`None` = everything).
    fn encode_update(&self, since: Option<&[u8]>) -> Result<Bytes, SyncError>;

    /// Apply a remote update. Emits a change when anything new was integrated.
    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), SyncError>;

    /// Subscribe to applied changes.
    fn subscribe(&self) -> broadcast::Receiver<DocumentChange>;
}

/// A key/value LWW document shared by every strategy in the process.
#[derive(Debug)]
pub struct SharedDocument {
    doc: RwLock<LwwDocument>,
    changes: broadcast::Sender<DocumentChange>,
}

impl SharedDocument {
    pub fn new(client: u64) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        Self {
            doc: RwLock::new(LwwDocument::new(ClientId::new(client))),
            changes,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.doc.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.doc.read().keys()
    }

    pub fn to_json(&self) -> Value {
        self.doc.read().to_json()
    }

    /// Local write.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<(), SyncError> {
        let update = self.doc.write().set(key, value);
        self.emit(&update, Origin::Local)
    }

    /// Local delete.
    pub fn delete(&self, key: impl Into<String>) -> Result<(), SyncError> {
        let update = self.doc.write().delete(key);
        self.emit(&update, Origin::Local)
    }

    fn emit(&self, update: &Update, origin: Origin) -> Result<(), SyncError> {
        if update.is_empty() {
            return Ok(());
        }
        let bytes = Bytes::from(update.encode()?);
        let _ = self.changes.send(DocumentChange {
            update: bytes,
            origin,
        });
        Ok(())
    }
}

impl DocumentReplica for SharedDocument {
    fn state_vector(&self) -> Result<Bytes, SyncError> {
        let doc = self.doc.read();
        Ok(Bytes::from(encode_state_vector(doc.state_vector())?))
    }

    fn encode_update(&self, since: Option<&[u8]>) -> Result<Bytes, SyncError> {
        let since = since.map(decode_state_vector).transpose()?;
        let update = self.doc.read().diff(since.as_ref());
        Ok(Bytes::from(update.encode()?))
    }

    fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), SyncError> {
        let update = Update::decode(update)?;
        // Apply and emit under one write lock so the change feed stays in
        // integration order.
        let integrated = self.doc.write().apply(update);
        self.emit(&integrated, origin)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::origin::ProviderTag;
    use serde_json::json;

    #[test]
    fn test_step_exchange_converges() {
        let a = SharedDocument::new(1);
        let b = SharedDocument::new(2);
        a.set("title", json!("notes")).unwrap();
        b.set("body", json!("hello")).unwrap();

        let for_b = a.encode_update(Some(&b.state_vector().unwrap())).unwrap();
        let for_a = b.encode_update(Some(&a.state_vector().unwrap())).unwrap();
        b.apply_update(&for_b, Origin::Local).unwrap();
        a.apply_update(&for_a, Origin::Local).unwrap();

        assert_eq!(a.to_json(), b.to_json());
        assert_eq!(a.get("title"), Some(json!("notes")));
    }

    #[test]
    fn test_apply_emits_with_origin_only_when_new() {
        let a = SharedDocument::new(1);
        let b = SharedDocument::new(2);
        a.set("k", json!(1)).unwrap();
        let full = a.encode_update(None).unwrap();

        let mut rx = b.subscribe();
        let tag = ProviderTag::new("room");
        b.apply_update(&full, Origin::Provider(tag.clone())).unwrap();
        let change = rx.try_recv().unwrap();
        assert!(change.origin.is_from(&tag));

        b.apply_update(&full, Origin::Provider(tag)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_local_writes_are_local_origin() {
        let doc = SharedDocument::new(1);
        let mut rx = doc.subscribe();
        doc.set("k", json!(true)).unwrap();
        doc.delete("k").unwrap();
        assert_eq!(rx.try_recv().unwrap().origin, Origin::Local);
        assert_eq!(rx.try_recv().unwrap().origin, Origin::Local);
        assert_eq!(doc.get("k"), None);
    }

    #[test]
    fn test_garbage_is_an_error() {
        let doc = SharedDocument::new(1);
        assert!(doc.apply_update(b"\xc1", Origin::Local).is_err());
        assert!(doc.encode_update(Some(b"\xc1")).is_err());
    }
}
