use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::graph::edge::{Edge, EdgeRef};
use crate::graph::vertex::Vertex;
use crate::ids::{EdgeTypeId, LabelId, PropertyId};
use crate::props::PropertyValue;

/// Transaction ids live in the upper half of the 64-bit space so a delta
/// timestamp cell self-describes: values at or above this bound belong to a
/// still-active writer, lower values are commit timestamps.
pub const TRANSACTION_INITIAL_ID: u64 = 1 << 63;

pub fn is_transaction_id(timestamp: u64) -> bool {
    timestamp >= TRANSACTION_INITIAL_ID
}

/// Edge payload of an adjacency delta: the edge type, the vertex on the
/// other side, and the edge reference.
#[derive(Debug, Clone)]
pub struct EdgeLink {
    pub edge_type: EdgeTypeId,
    pub vertex: Arc<Vertex>,
    pub edge: EdgeRef,
}

/// Undo record payload. Each variant describes the inverse of the forward
/// mutation that created it.
#[derive(Debug, Clone)]
pub enum DeltaAction {
    /// Undo a creation by deleting the object.
    DeleteObject,
    /// Same as [`DeltaAction::DeleteObject`], for objects materialised from
    /// disk rather than created by a transaction.
    DeleteDeserializedObject,
    /// Undo a deletion by clearing the deleted flag.
    RecreateObject,
    AddLabel(LabelId),
    RemoveLabel(LabelId),
    /// Restore the previous value; `Null` restores absence.
    SetProperty {
        key: PropertyId,
        value: PropertyValue,
    },
    AddInEdge(EdgeLink),
    RemoveInEdge(EdgeLink),
    AddOutEdge(EdgeLink),
    RemoveOutEdge(EdgeLink),
}

/// Discriminated back-pointer from a delta to whatever holds it: the next
/// newer delta in the chain, or the owning object when the delta is the
/// chain head. Weak so the chain never keeps its owner alive.
#[derive(Debug, Clone, Default)]
pub enum PreviousPtr {
    #[default]
    Null,
    Delta(Weak<Delta>),
    Vertex(Weak<Vertex>),
    Edge(Weak<Edge>),
}

#[derive(Debug)]
pub struct Delta {
    pub action: DeltaAction,
    /// Shared with every delta of the creating transaction. Holds the
    /// transaction id while the writer is active; the commit timestamp is
    /// published into it with a single store. Unchanged after abort.
    pub timestamp: Arc<AtomicU64>,
    next: Mutex<Option<Arc<Delta>>>,
    prev: Mutex<PreviousPtr>,
}

impl Delta {
    pub fn new(action: DeltaAction, timestamp: Arc<AtomicU64>) -> Arc<Self> {
        Arc::new(Self {
            action,
            timestamp,
            next: Mutex::new(None),
            prev: Mutex::new(PreviousPtr::Null),
        })
    }

    pub fn load_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Next older delta in the chain.
    pub fn next(&self) -> Option<Arc<Delta>> {
        self.next.lock().clone()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Delta>>) {
        *self.next.lock() = next;
    }

    pub fn prev(&self) -> PreviousPtr {
        self.prev.lock().clone()
    }

    pub(crate) fn set_prev(&self, prev: PreviousPtr) {
        *self.prev.lock() = prev;
    }
}
