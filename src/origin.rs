//! Origin tags for replicated changes.
//!
//! Every change applied to the shared document or presence table carries an
//! [`Origin`]. A replication provider tags what it applies with its own
//! [`ProviderTag`] so it can skip re-broadcasting its own input, and so a
//! strategy can attribute presence changes to itself. Tags compare by
//! identity: two providers created with the same label are still distinct.

use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct TagInner {
    label: String,
}

/// Identity of one replication provider instance.
#[derive(Clone)]
pub struct ProviderTag(Arc<TagInner>);

impl ProviderTag {
    pub fn new(label: impl Into<String>) -> Self {
        Self(Arc::new(TagInner {
            label: label.into(),
        }))
    }

    /// Human-readable label (the room name). Not used for equality.
    pub fn label(&self) -> &str {
        &self.0.label
    }
}

impl PartialEq for ProviderTag {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ProviderTag {}

impl fmt::Debug for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderTag({}@{:p})", self.0.label, Arc::as_ptr(&self.0))
    }
}

/// Who produced a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// The host application (or housekeeping such as liveness expiry).
    Local,
    /// A replication provider relaying remote input.
    Provider(ProviderTag),
}

impl Origin {
    /// Whether this change was applied by the given provider.
    pub fn is_from(&self, tag: &ProviderTag) -> bool {
        matches!(self, Self::Provider(t) if t == tag)
    }
}
