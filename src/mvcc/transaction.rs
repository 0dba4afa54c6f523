use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::graph::vertex::{EdgeEntry, Vertex};
use crate::ids::Gid;
use crate::mvcc::delta::{is_transaction_id, Delta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    SnapshotIsolation,
    ReadCommitted,
    ReadUncommitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// MVCC with delta chains; the default.
    InMemoryTransactional,
    /// In-place writes, no deltas, no isolation.
    InMemoryAnalytical,
}

/// Per-read selector: `New` includes the reading transaction's own
/// uncommitted writes, `Old` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Old,
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    In,
    Out,
}

/// Materialised adjacency views, keyed by vertex, direction and view.
/// Any write touching a vertex drops its entries.
#[derive(Debug, Default)]
pub(crate) struct AdjacencyCache {
    entries: HashMap<(Gid, Direction, View), Vec<EdgeEntry>>,
}

impl AdjacencyCache {
    pub(crate) fn get(&self, gid: Gid, direction: Direction, view: View) -> Option<&Vec<EdgeEntry>> {
        self.entries.get(&(gid, direction, view))
    }

    pub(crate) fn insert(
        &mut self,
        gid: Gid,
        direction: Direction,
        view: View,
        edges: Vec<EdgeEntry>,
    ) {
        self.entries.insert((gid, direction, view), edges);
    }

    pub(crate) fn invalidate(&mut self, gid: Gid) {
        self.entries.retain(|(entry_gid, _, _), _| *entry_gid != gid);
    }
}

#[derive(Debug)]
pub struct Transaction {
    pub(crate) transaction_id: u64,
    pub(crate) start_timestamp: u64,
    pub(crate) isolation_level: IsolationLevel,
    pub(crate) storage_mode: StorageMode,
    /// Shared with every delta this transaction creates. Holds the
    /// transaction id until commit publishes the commit timestamp into it.
    pub(crate) commit_timestamp: Arc<AtomicU64>,
    pub(crate) deltas: Mutex<Vec<Arc<Delta>>>,
    pub(crate) must_abort: Arc<AtomicBool>,
    pub(crate) modified_vertices: Mutex<HashMap<Gid, Arc<Vertex>>>,
    pub(crate) adjacency_cache: Mutex<AdjacencyCache>,
}

impl Transaction {
    pub(crate) fn new(
        transaction_id: u64,
        start_timestamp: u64,
        isolation_level: IsolationLevel,
        storage_mode: StorageMode,
    ) -> Self {
        Self {
            transaction_id,
            start_timestamp,
            isolation_level,
            storage_mode,
            commit_timestamp: Arc::new(AtomicU64::new(transaction_id)),
            deltas: Mutex::new(Vec::new()),
            must_abort: Arc::new(AtomicBool::new(false)),
            modified_vertices: Mutex::new(HashMap::new()),
            adjacency_cache: Mutex::new(AdjacencyCache::default()),
        }
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    pub fn start_timestamp(&self) -> u64 {
        self.start_timestamp
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage_mode
    }

    /// Whether a committed delta timestamp is part of this transaction's
    /// view. Transaction ids of foreign writers never are.
    pub(crate) fn committed_visible(&self, timestamp: u64) -> bool {
        match self.isolation_level {
            IsolationLevel::SnapshotIsolation => timestamp <= self.start_timestamp,
            IsolationLevel::ReadCommitted => !is_transaction_id(timestamp),
            IsolationLevel::ReadUncommitted => true,
        }
    }

    pub(crate) fn push_delta(&self, delta: Arc<Delta>) {
        self.deltas.lock().push(delta);
    }

    pub(crate) fn has_deltas(&self) -> bool {
        !self.deltas.lock().is_empty()
    }

    pub(crate) fn mark_modified(&self, vertex: &Arc<Vertex>) {
        self.modified_vertices
            .lock()
            .entry(vertex.gid)
            .or_insert_with(|| Arc::clone(vertex));
    }

    pub fn set_must_abort(&self) {
        self.must_abort.store(true, Ordering::Release);
    }

    pub(crate) fn must_abort(&self) -> bool {
        self.must_abort.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_cached_adjacency(&self, gid: Gid) {
        self.adjacency_cache.lock().invalidate(gid);
    }
}
