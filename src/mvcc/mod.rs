pub mod commit_log;
pub mod delta;
pub mod transaction;

use std::sync::Arc;

use crate::graph::edge::{Edge, EdgeData};
use crate::graph::vertex::{Vertex, VertexData};
use crate::ids::{LabelId, PropertyId};
use crate::mvcc::delta::{is_transaction_id, Delta, DeltaAction, PreviousPtr};
use crate::mvcc::transaction::{StorageMode, Transaction, View};
use crate::props::PropertyValue;

/// Checks whether `txn` may install a new delta in front of `head`.
///
/// Writing is allowed when the chain is empty, when the head already belongs
/// to this transaction, or when the head was committed no later than this
/// transaction's start (first-committer-wins). A foreign active writer or a
/// commit after our start is a write-write conflict.
pub(crate) fn prepare_for_write(txn: &Transaction, head: &Option<Arc<Delta>>) -> bool {
    if txn.storage_mode == StorageMode::InMemoryAnalytical {
        return true;
    }
    match head {
        None => true,
        Some(delta) => {
            let ts = delta.load_timestamp();
            ts == txn.transaction_id || ts <= txn.start_timestamp
        }
    }
}

/// Allocates a compensating delta, stamps it with the transaction's shared
/// timestamp cell and splices it in front of the vertex's chain. The caller
/// holds the vertex's write lock. No-op in analytical mode.
pub(crate) fn link_delta_vertex(
    txn: &Transaction,
    vertex: &Arc<Vertex>,
    data: &mut VertexData,
    action: DeltaAction,
) {
    if txn.storage_mode == StorageMode::InMemoryAnalytical {
        return;
    }
    let delta = Delta::new(action, Arc::clone(&txn.commit_timestamp));
    if let Some(head) = &data.delta {
        head.set_prev(PreviousPtr::Delta(Arc::downgrade(&delta)));
        delta.set_next(Some(Arc::clone(head)));
    }
    delta.set_prev(PreviousPtr::Vertex(Arc::downgrade(vertex)));
    txn.push_delta(Arc::clone(&delta));
    txn.mark_modified(vertex);
    data.delta = Some(delta);
}

/// Edge-chain variant of [`link_delta_vertex`].
pub(crate) fn link_delta_edge(
    txn: &Transaction,
    edge: &Arc<Edge>,
    data: &mut EdgeData,
    action: DeltaAction,
) {
    if txn.storage_mode == StorageMode::InMemoryAnalytical {
        return;
    }
    let delta = Delta::new(action, Arc::clone(&txn.commit_timestamp));
    if let Some(head) = &data.delta {
        head.set_prev(PreviousPtr::Delta(Arc::downgrade(&delta)));
        delta.set_next(Some(Arc::clone(head)));
    }
    delta.set_prev(PreviousPtr::Edge(Arc::downgrade(edge)));
    txn.push_delta(Arc::clone(&delta));
    data.delta = Some(delta);
}

/// Walks a delta chain from the captured head, calling `apply` for every
/// record the reader must undo to reach the state its view selects.
///
/// The walk stops as soon as it reaches a delta the view already includes:
/// the reader's own writes under `View::New`, or a committed timestamp the
/// transaction's isolation level admits.
pub(crate) fn apply_deltas_for_read<F>(
    txn: &Transaction,
    head: Option<Arc<Delta>>,
    view: View,
    mut apply: F,
) where
    F: FnMut(&DeltaAction),
{
    let mut cursor = head;
    while let Some(delta) = cursor {
        let ts = delta.load_timestamp();
        if ts == txn.transaction_id {
            if view == View::New {
                break;
            }
        } else if txn.committed_visible(ts) {
            break;
        }
        apply(&delta.action);
        cursor = delta.next();
    }
}

/// Whether any version of `vertex` reachable by a live transaction (start
/// timestamp at or above `oldest_active`) carries `label` and, when `probe`
/// is given, the probed `(key, value)` pair. Used when the garbage collector
/// decides if an index or constraint entry is still needed.
pub(crate) fn any_reachable_version_satisfies(
    vertex: &Vertex,
    label: LabelId,
    probe: Option<(PropertyId, &PropertyValue)>,
    oldest_active: u64,
) -> bool {
    let (mut deleted, mut has_label, mut value, head) = {
        let data = vertex.data().read();
        (
            data.deleted,
            data.labels.contains(&label),
            probe.map(|(key, _)| data.properties.get(key)),
            data.delta.clone(),
        )
    };
    let matches = |deleted: bool, has_label: bool, value: &Option<PropertyValue>| {
        !deleted
            && has_label
            && match (probe, value) {
                (Some((_, target)), Some(current)) => current == target,
                _ => true,
            }
    };
    if matches(deleted, has_label, &value) {
        return true;
    }
    let mut cursor = head;
    while let Some(delta) = cursor {
        let ts = delta.load_timestamp();
        if !is_transaction_id(ts) && ts < oldest_active {
            break;
        }
        match &delta.action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => return false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::AddLabel(l) => {
                if *l == label {
                    has_label = true;
                }
            }
            DeltaAction::RemoveLabel(l) => {
                if *l == label {
                    has_label = false;
                }
            }
            DeltaAction::SetProperty { key, value: old } => {
                if let Some((probe_key, _)) = probe {
                    if *key == probe_key {
                        value = Some(old.clone());
                    }
                }
            }
            _ => {}
        }
        if matches(deleted, has_label, &value) {
            return true;
        }
        cursor = delta.next();
    }
    false
}

/// Reconstructs the state of `vertex` as of `commit_timestamp`, ignoring the
/// validating transaction's own writes, and reports whether that state
/// carries `label` together with exactly `values` for `keys`. This is the
/// historical probe unique-constraint validation runs at commit.
pub(crate) fn last_committed_version_satisfies(
    vertex: &Vertex,
    label: LabelId,
    keys: &[PropertyId],
    values: &[PropertyValue],
    txn: &Transaction,
    commit_timestamp: u64,
) -> bool {
    let (mut deleted, mut has_label, mut current, head) = {
        let data = vertex.data().read();
        (
            data.deleted,
            data.labels.contains(&label),
            keys.iter()
                .map(|&key| data.properties.get(key))
                .collect::<Vec<_>>(),
            data.delta.clone(),
        )
    };
    let mut cursor = head;
    while let Some(delta) = cursor {
        let ts = delta.load_timestamp();
        // Undo our own writes and everything not committed strictly before
        // the validating commit timestamp.
        if ts != txn.transaction_id && !is_transaction_id(ts) && ts < commit_timestamp {
            break;
        }
        match &delta.action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => return false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::AddLabel(l) => {
                if *l == label {
                    has_label = true;
                }
            }
            DeltaAction::RemoveLabel(l) => {
                if *l == label {
                    has_label = false;
                }
            }
            DeltaAction::SetProperty { key, value: old } => {
                if let Some(index) = keys.iter().position(|k| k == key) {
                    current[index] = old.clone();
                }
            }
            _ => {}
        }
        cursor = delta.next();
    }
    !deleted && has_label && current.iter().zip(values).all(|(a, b)| a == b)
}
