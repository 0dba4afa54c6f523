use std::sync::Arc;

use parking_lot::RwLock;

use crate::ids::Gid;
use crate::mvcc::delta::Delta;
use crate::props::PropertyStore;

/// Mutable edge state, guarded by the per-object lock. Only materialised
/// when properties-on-edges is enabled.
#[derive(Debug, Default)]
pub struct EdgeData {
    pub properties: PropertyStore,
    pub deleted: bool,
    pub delta: Option<Arc<Delta>>,
}

pub struct Edge {
    pub gid: Gid,
    pub(crate) data: RwLock<EdgeData>,
}

// Debug prints the identity only; the payload links back into the graph.
impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge").field("gid", &self.gid).finish()
    }
}

impl Edge {
    pub(crate) fn new(gid: Gid) -> Arc<Self> {
        Arc::new(Self {
            gid,
            data: RwLock::new(EdgeData::default()),
        })
    }

    pub(crate) fn data(&self) -> &RwLock<EdgeData> {
        &self.data
    }
}

/// Tagged edge reference. The representation is frozen at database creation:
/// a bare gid when properties-on-edges is disabled, an owned object
/// otherwise.
#[derive(Debug, Clone)]
pub enum EdgeRef {
    Gid(Gid),
    Ptr(Arc<Edge>),
}

impl EdgeRef {
    pub fn gid(&self) -> Gid {
        match self {
            EdgeRef::Gid(gid) => *gid,
            EdgeRef::Ptr(edge) => edge.gid,
        }
    }

    pub(crate) fn ptr(&self) -> Option<&Arc<Edge>> {
        match self {
            EdgeRef::Gid(_) => None,
            EdgeRef::Ptr(edge) => Some(edge),
        }
    }
}

impl PartialEq for EdgeRef {
    fn eq(&self, other: &Self) -> bool {
        self.gid() == other.gid()
    }
}

impl Eq for EdgeRef {}
