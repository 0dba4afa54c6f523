use std::cmp::Ordering;
use std::collections::HashMap;
use std::ops::Bound;
use std::sync::Arc;

use crossbeam_skiplist::{SkipMap, SkipSet};
use parking_lot::RwLock;

use crate::graph::vertex::Vertex;
use crate::ids::{Gid, LabelId, PropertyId};
use crate::mvcc::delta::DeltaAction;
use crate::mvcc::transaction::{Transaction, View};
use crate::mvcc::{any_reachable_version_satisfies, apply_deltas_for_read};
use crate::props::PropertyValue;

/// Re-walks the delta chain and reports whether `vertex` carries `label` in
/// the transaction's selected view.
pub(crate) fn current_version_has_label(
    vertex: &Vertex,
    label: LabelId,
    txn: &Transaction,
    view: View,
) -> bool {
    let (mut exists, mut deleted, mut has_label, head) = {
        let data = vertex.data().read();
        (
            true,
            data.deleted,
            data.labels.contains(&label),
            data.delta.clone(),
        )
    };
    apply_deltas_for_read(txn, head, view, |action| match action {
        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
        DeltaAction::RecreateObject => deleted = false,
        DeltaAction::AddLabel(l) if *l == label => has_label = true,
        DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
        _ => {}
    });
    exists && !deleted && has_label
}

/// Same, for `label` together with `key == value`.
pub(crate) fn current_version_has_label_property(
    vertex: &Vertex,
    label: LabelId,
    key: PropertyId,
    value: &PropertyValue,
    txn: &Transaction,
    view: View,
) -> bool {
    let (mut exists, mut deleted, mut has_label, mut current, head) = {
        let data = vertex.data().read();
        (
            true,
            data.deleted,
            data.labels.contains(&label),
            data.properties.get(key),
            data.delta.clone(),
        )
    };
    apply_deltas_for_read(txn, head, view, |action| match action {
        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
        DeltaAction::RecreateObject => deleted = false,
        DeltaAction::AddLabel(l) if *l == label => has_label = true,
        DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
        DeltaAction::SetProperty { key: k, value: old } if *k == key => current = old.clone(),
        _ => {}
    });
    exists && !deleted && has_label && current == *value
}

#[derive(Debug)]
struct LabelEntry {
    vertex: Arc<Vertex>,
    timestamp: u64,
}

impl LabelEntry {
    fn key(&self) -> (Gid, u64) {
        (self.vertex.gid, self.timestamp)
    }
}

impl PartialEq for LabelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for LabelEntry {}

impl PartialOrd for LabelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LabelEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// `label -> set of vertices` index. Entries are installed by the mutating
/// operation before it commits, stamped with the writer's start timestamp;
/// iteration reconciles visibility against the delta chain, and the garbage
/// collector removes entries no reachable version justifies.
#[derive(Debug, Default)]
pub struct LabelIndex {
    sets: RwLock<HashMap<LabelId, Arc<SkipSet<LabelEntry>>>>,
}

impl LabelIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the index from the current state of `vertices`. Runs under
    /// the exclusive storage lock, so that state is the last committed one.
    /// Returns `false` when the index already exists.
    pub(crate) fn create(&self, label: LabelId, vertices: &SkipMap<Gid, Arc<Vertex>>) -> bool {
        let set = Arc::new(SkipSet::new());
        for entry in vertices.iter() {
            let vertex = entry.value();
            let data = vertex.data().read();
            if !data.deleted && data.labels.contains(&label) {
                set.insert(LabelEntry {
                    vertex: Arc::clone(vertex),
                    timestamp: 0,
                });
            }
        }
        let mut sets = self.sets.write();
        if sets.contains_key(&label) {
            return false;
        }
        sets.insert(label, set);
        true
    }

    pub(crate) fn drop_index(&self, label: LabelId) -> bool {
        self.sets.write().remove(&label).is_some()
    }

    pub(crate) fn has(&self, label: LabelId) -> bool {
        self.sets.read().contains_key(&label)
    }

    pub(crate) fn list(&self) -> Vec<LabelId> {
        let mut labels: Vec<_> = self.sets.read().keys().copied().collect();
        labels.sort();
        labels
    }

    pub(crate) fn update_on_add_label(
        &self,
        label: LabelId,
        vertex: &Arc<Vertex>,
        txn: &Transaction,
    ) {
        let set = match self.sets.read().get(&label) {
            Some(set) => Arc::clone(set),
            None => return,
        };
        set.insert(LabelEntry {
            vertex: Arc::clone(vertex),
            timestamp: txn.start_timestamp,
        });
    }

    /// Vertices visible under `view` that carry `label`, in gid order.
    pub(crate) fn vertices(
        &self,
        label: LabelId,
        txn: &Transaction,
        view: View,
    ) -> Option<Vec<Arc<Vertex>>> {
        let set = Arc::clone(self.sets.read().get(&label)?);
        let mut out = Vec::new();
        let mut last_gid = None;
        for entry in set.iter() {
            let gid = entry.value().vertex.gid;
            if last_gid == Some(gid) {
                continue;
            }
            last_gid = Some(gid);
            if current_version_has_label(&entry.value().vertex, label, txn, view) {
                out.push(Arc::clone(&entry.value().vertex));
            }
        }
        Some(out)
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .map(|(&label, set)| (label, Arc::clone(set)))
            .collect();
        for (label, set) in sets {
            for entry in set.iter() {
                let item = entry.value();
                if item.timestamp < oldest_active
                    && !any_reachable_version_satisfies(&item.vertex, label, None, oldest_active)
                {
                    entry.remove();
                }
            }
        }
    }
}

#[derive(Debug)]
struct PropertyEntry {
    value: PropertyValue,
    gid: Gid,
    timestamp: u64,
    /// `None` only in probe entries used as range bounds.
    vertex: Option<Arc<Vertex>>,
}

impl PropertyEntry {
    fn probe(value: PropertyValue, gid: Gid, timestamp: u64) -> Self {
        Self {
            value,
            gid,
            timestamp,
            vertex: None,
        }
    }

    fn key(&self) -> (&PropertyValue, Gid, u64) {
        (&self.value, self.gid, self.timestamp)
    }
}

impl PartialEq for PropertyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for PropertyEntry {}

impl PartialOrd for PropertyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PropertyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

fn value_range_to_entry_range(
    lower: Bound<PropertyValue>,
    upper: Bound<PropertyValue>,
) -> (Bound<PropertyEntry>, Bound<PropertyEntry>) {
    let lower = match lower {
        Bound::Included(value) => Bound::Included(PropertyEntry::probe(value, Gid::from_u64(0), 0)),
        Bound::Excluded(value) => {
            Bound::Excluded(PropertyEntry::probe(value, Gid::from_u64(u64::MAX), u64::MAX))
        }
        Bound::Unbounded => Bound::Unbounded,
    };
    let upper = match upper {
        Bound::Included(value) => {
            Bound::Included(PropertyEntry::probe(value, Gid::from_u64(u64::MAX), u64::MAX))
        }
        Bound::Excluded(value) => Bound::Excluded(PropertyEntry::probe(value, Gid::from_u64(0), 0)),
        Bound::Unbounded => Bound::Unbounded,
    };
    (lower, upper)
}

/// `(label, property) -> sorted entries` index backed by a skip-list ordered
/// by value, then vertex, then insertion timestamp. Range scans come out
/// ordered by property value.
#[derive(Debug, Default)]
pub struct LabelPropertyIndex {
    sets: RwLock<HashMap<(LabelId, PropertyId), Arc<SkipSet<PropertyEntry>>>>,
}

impl LabelPropertyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(
        &self,
        label: LabelId,
        property: PropertyId,
        vertices: &SkipMap<Gid, Arc<Vertex>>,
    ) -> bool {
        let set = Arc::new(SkipSet::new());
        for entry in vertices.iter() {
            let vertex = entry.value();
            let data = vertex.data().read();
            if data.deleted || !data.labels.contains(&label) {
                continue;
            }
            let value = data.properties.get(property);
            if value.is_null() {
                continue;
            }
            set.insert(PropertyEntry {
                value,
                gid: vertex.gid,
                timestamp: 0,
                vertex: Some(Arc::clone(vertex)),
            });
        }
        let mut sets = self.sets.write();
        if sets.contains_key(&(label, property)) {
            return false;
        }
        sets.insert((label, property), set);
        true
    }

    pub(crate) fn drop_index(&self, label: LabelId, property: PropertyId) -> bool {
        self.sets.write().remove(&(label, property)).is_some()
    }

    pub(crate) fn has(&self, label: LabelId, property: PropertyId) -> bool {
        self.sets.read().contains_key(&(label, property))
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, PropertyId)> {
        let mut pairs: Vec<_> = self.sets.read().keys().copied().collect();
        pairs.sort();
        pairs
    }

    /// Called with the vertex lock held, right after `label` was added.
    pub(crate) fn update_on_add_label(
        &self,
        label: LabelId,
        vertex: &Arc<Vertex>,
        properties: &crate::props::PropertyStore,
        txn: &Transaction,
    ) {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .filter(|((l, _), _)| *l == label)
            .map(|(&(_, p), set)| (p, Arc::clone(set)))
            .collect();
        for (property, set) in sets {
            let value = properties.get(property);
            if value.is_null() {
                continue;
            }
            set.insert(PropertyEntry {
                value,
                gid: vertex.gid,
                timestamp: txn.start_timestamp,
                vertex: Some(Arc::clone(vertex)),
            });
        }
    }

    /// Called with the vertex lock held, right after `key` was set.
    pub(crate) fn update_on_set_property(
        &self,
        key: PropertyId,
        value: &PropertyValue,
        vertex: &Arc<Vertex>,
        labels: &[LabelId],
        txn: &Transaction,
    ) {
        if value.is_null() {
            return;
        }
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .filter(|((l, p), _)| *p == key && labels.contains(l))
            .map(|(_, set)| Arc::clone(set))
            .collect();
        for set in sets {
            set.insert(PropertyEntry {
                value: value.clone(),
                gid: vertex.gid,
                timestamp: txn.start_timestamp,
                vertex: Some(Arc::clone(vertex)),
            });
        }
    }

    /// Vertices visible under `view` whose indexed value falls inside the
    /// bounds, ordered by property value. Unbounded on both sides scans the
    /// whole index.
    pub(crate) fn vertices_in_range(
        &self,
        label: LabelId,
        property: PropertyId,
        lower: Bound<PropertyValue>,
        upper: Bound<PropertyValue>,
        txn: &Transaction,
        view: View,
    ) -> Option<Vec<Arc<Vertex>>> {
        let set = Arc::clone(self.sets.read().get(&(label, property))?);
        let range = value_range_to_entry_range(lower, upper);
        let mut out = Vec::new();
        let mut last: Option<(Gid, PropertyValue)> = None;
        for entry in set.range(range) {
            let item = entry.value();
            if last
                .as_ref()
                .is_some_and(|(gid, value)| *gid == item.gid && *value == item.value)
            {
                continue;
            }
            last = Some((item.gid, item.value.clone()));
            let vertex = item.vertex.as_ref().expect("stored entries carry a vertex");
            if current_version_has_label_property(vertex, label, property, &item.value, txn, view) {
                out.push(Arc::clone(vertex));
            }
        }
        Some(out)
    }

    pub(crate) fn vertices_by_value(
        &self,
        label: LabelId,
        property: PropertyId,
        value: &PropertyValue,
        txn: &Transaction,
        view: View,
    ) -> Option<Vec<Arc<Vertex>>> {
        self.vertices_in_range(
            label,
            property,
            Bound::Included(value.clone()),
            Bound::Included(value.clone()),
            txn,
            view,
        )
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .map(|(&pair, set)| (pair, Arc::clone(set)))
            .collect();
        for ((label, property), set) in sets {
            for entry in set.iter() {
                let item = entry.value();
                let vertex = item.vertex.as_ref().expect("stored entries carry a vertex");
                if item.timestamp < oldest_active
                    && !any_reachable_version_satisfies(
                        vertex,
                        label,
                        Some((property, &item.value)),
                        oldest_active,
                    )
                {
                    entry.remove();
                }
            }
        }
    }
}
