use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::graph::edge::EdgeRef;
use crate::ids::{EdgeTypeId, Gid, LabelId};
use crate::mvcc::delta::Delta;
use crate::props::PropertyStore;

/// One adjacency slot: edge type, the vertex on the other side, and the
/// edge itself.
#[derive(Debug, Clone)]
pub struct EdgeEntry {
    pub edge_type: EdgeTypeId,
    pub vertex: Arc<Vertex>,
    pub edge: EdgeRef,
}

impl EdgeEntry {
    pub fn matches(&self, edge_type: EdgeTypeId, vertex: &Arc<Vertex>, edge: &EdgeRef) -> bool {
        self.edge_type == edge_type && self.vertex.gid == vertex.gid && self.edge == *edge
    }
}

/// Mutable vertex state, guarded by the per-object lock.
#[derive(Debug, Default)]
pub struct VertexData {
    pub labels: SmallVec<[LabelId; 4]>,
    pub properties: PropertyStore,
    pub in_edges: Vec<EdgeEntry>,
    pub out_edges: Vec<EdgeEntry>,
    pub deleted: bool,
    pub delta: Option<Arc<Delta>>,
}

pub struct Vertex {
    pub gid: Gid,
    pub(crate) data: RwLock<VertexData>,
}

// Adjacency entries and delta chains form reference cycles between
// objects, so Debug prints the identity only.
impl std::fmt::Debug for Vertex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vertex").field("gid", &self.gid).finish()
    }
}

impl Vertex {
    pub(crate) fn new(gid: Gid) -> Arc<Self> {
        Arc::new(Self {
            gid,
            data: RwLock::new(VertexData::default()),
        })
    }

    pub(crate) fn data(&self) -> &RwLock<VertexData> {
        &self.data
    }
}

/// Removes one adjacency entry with the swap-with-last idiom; slot order is
/// not semantic. Returns whether an entry was removed.
pub(crate) fn remove_edge_entry(
    entries: &mut Vec<EdgeEntry>,
    edge_type: EdgeTypeId,
    vertex: &Arc<Vertex>,
    edge: &EdgeRef,
) -> bool {
    match entries
        .iter()
        .position(|entry| entry.matches(edge_type, vertex, edge))
    {
        Some(index) => {
            entries.swap_remove(index);
            true
        }
        None => false,
    }
}
