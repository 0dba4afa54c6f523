use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::mvcc::delta::{Delta, PreviousPtr};
use crate::mvcc::transaction::StorageMode;
use crate::storage::Storage;

impl Storage {
    /// One garbage-collection pass. Returns immediately when another pass
    /// is already running.
    ///
    /// Works front-to-back over the committed-transactions list: every
    /// transaction committed before the oldest still-active start timestamp
    /// has deltas no reader can need, so its chains are unlinked, revealed
    /// deleted objects are reclaimed, index and constraint residue is
    /// pruned, and the detached buffers are released once their handover
    /// tag falls behind the horizon.
    pub fn collect_garbage(&self) {
        let Some(_guard) = self.gc_lock.try_lock() else {
            return;
        };
        let oldest_active = self
            .commit_log
            .oldest_active()
            .unwrap_or_else(|| self.peek_timestamp());

        let mut expired = Vec::new();
        {
            let mut committed = self.committed.lock();
            while committed
                .front()
                .is_some_and(|txn| txn.commit_timestamp < oldest_active)
            {
                if let Some(txn) = committed.pop_front() {
                    expired.push(txn);
                }
            }
        }
        if !expired.is_empty() {
            debug!(
                oldest_active,
                transactions = expired.len(),
                "unlinking expired delta chains"
            );
        }
        for txn in &expired {
            for delta in &txn.deltas {
                self.unlink_delta(delta);
            }
        }
        if !expired.is_empty() {
            let mark = self.peek_timestamp();
            let mut garbage = self.garbage_deltas.lock();
            for txn in expired {
                garbage.push_back((mark, txn.deltas));
            }
        }

        self.label_index.remove_obsolete_entries(oldest_active);
        self.label_property_index
            .remove_obsolete_entries(oldest_active);
        self.unique_constraints
            .remove_obsolete_entries(oldest_active);

        {
            let mut garbage = self.garbage_deltas.lock();
            while garbage
                .front()
                .is_some_and(|(mark, _)| *mark < oldest_active)
            {
                garbage.pop_front();
            }
        }

        self.reclaim_deleted_objects();

        if self.storage_mode() == StorageMode::InMemoryAnalytical {
            self.analytical_full_scan();
        }
    }

    /// Detaches one expired delta from whatever still points at it. The
    /// chain below an expired delta is strictly older, so an expired chain
    /// head takes its whole chain with it.
    fn unlink_delta(&self, delta: &Arc<Delta>) {
        loop {
            match delta.prev() {
                PreviousPtr::Null => return,
                PreviousPtr::Delta(weak) => {
                    // Mid-chain: the newer neighbour belongs to a younger
                    // transaction; cut everything from this delta down.
                    if let Some(newer) = weak.upgrade() {
                        newer.set_next(None);
                    }
                    return;
                }
                PreviousPtr::Vertex(weak) => {
                    let Some(vertex) = weak.upgrade() else { return };
                    let mut data = vertex.data().write();
                    let is_head = data
                        .delta
                        .as_ref()
                        .is_some_and(|head| Arc::ptr_eq(head, delta));
                    if is_head {
                        data.delta = None;
                        let reveal_deleted = data.deleted;
                        drop(data);
                        if reveal_deleted {
                            self.deleted_vertices.lock().push(vertex.gid);
                        }
                        return;
                    }
                    drop(data);
                    // A writer spliced a newer delta in front of us between
                    // the back-pointer read and the lock; retry with the
                    // updated pointer, unless the chain was already cut.
                    if matches!(delta.prev(), PreviousPtr::Vertex(_)) {
                        return;
                    }
                }
                PreviousPtr::Edge(weak) => {
                    let Some(edge) = weak.upgrade() else { return };
                    let mut data = edge.data().write();
                    let is_head = data
                        .delta
                        .as_ref()
                        .is_some_and(|head| Arc::ptr_eq(head, delta));
                    if is_head {
                        data.delta = None;
                        let reveal_deleted = data.deleted;
                        drop(data);
                        if reveal_deleted {
                            self.deleted_edges.lock().push(edge.gid);
                        }
                        return;
                    }
                    drop(data);
                    if matches!(delta.prev(), PreviousPtr::Edge(_)) {
                        return;
                    }
                }
            }
        }
    }

    /// Removes fully unreachable deleted objects from the skip-lists. An
    /// object whose deletion is still shielded by a delta chain goes back
    /// on the queue for a later pass.
    fn reclaim_deleted_objects(&self) {
        let vertices: Vec<_> = std::mem::take(&mut *self.deleted_vertices.lock());
        for gid in vertices {
            if let Some(entry) = self.vertices.get(&gid) {
                let removable = {
                    let data = entry.value().data().read();
                    data.deleted && data.delta.is_none()
                };
                if removable {
                    entry.remove();
                } else {
                    self.deleted_vertices.lock().push(gid);
                }
            }
        }
        let edges: Vec<_> = std::mem::take(&mut *self.deleted_edges.lock());
        for gid in edges {
            if let Some(entry) = self.edges.get(&gid) {
                let removable = {
                    let data = entry.value().data().read();
                    data.deleted && data.delta.is_none()
                };
                if removable {
                    entry.remove();
                } else {
                    self.deleted_edges.lock().push(gid);
                }
            }
        }
    }

    /// Analytical mode writes no deltas, so deletions flag a full sweep
    /// instead of queueing precise gids.
    fn analytical_full_scan(&self) {
        if self.gc_full_scan_vertices.swap(false, Ordering::AcqRel) {
            for entry in self.vertices.iter() {
                let removable = {
                    let data = entry.value().data().read();
                    data.deleted && data.delta.is_none()
                };
                if removable {
                    entry.remove();
                }
            }
        }
        if self.gc_full_scan_edges.swap(false, Ordering::AcqRel) {
            for entry in self.edges.iter() {
                let removable = {
                    let data = entry.value().data().read();
                    data.deleted && data.delta.is_none()
                };
                if removable {
                    entry.remove();
                }
            }
        }
    }
}
