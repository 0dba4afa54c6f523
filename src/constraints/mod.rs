use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crossbeam_skiplist::{SkipMap, SkipSet};
use parking_lot::RwLock;

use crate::error::{ConstraintKind, Result, StorageError};
use crate::graph::vertex::Vertex;
use crate::ids::{Gid, LabelId, PropertyId};
use crate::mvcc::delta::{is_transaction_id, DeltaAction};
use crate::mvcc::last_committed_version_satisfies;
use crate::mvcc::transaction::Transaction;
use crate::props::PropertyValue;

/// Upper bound on the number of properties a unique constraint may span.
pub const MAX_UNIQUE_CONSTRAINT_PROPERTIES: usize = 4;

/// `(label, property)` pairs that every committed vertex must satisfy: a
/// vertex carrying the label must carry the property.
#[derive(Debug, Default)]
pub struct ExistenceConstraints {
    constraints: RwLock<Vec<(LabelId, PropertyId)>>,
}

impl ExistenceConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constraint after verifying the current state of every
    /// vertex. Runs under the exclusive storage lock. `Ok(false)` means the
    /// constraint already existed.
    pub(crate) fn create(
        &self,
        label: LabelId,
        property: PropertyId,
        vertices: &SkipMap<Gid, Arc<Vertex>>,
    ) -> Result<bool> {
        if self.constraints.read().contains(&(label, property)) {
            return Ok(false);
        }
        for entry in vertices.iter() {
            let data = entry.value().data().read();
            if !data.deleted && data.labels.contains(&label) && !data.properties.has(property) {
                return Err(StorageError::ConstraintViolation {
                    kind: ConstraintKind::Existence,
                    label,
                    properties: vec![property],
                });
            }
        }
        self.constraints.write().push((label, property));
        Ok(true)
    }

    pub(crate) fn drop_constraint(&self, label: LabelId, property: PropertyId) -> bool {
        let mut constraints = self.constraints.write();
        match constraints.iter().position(|&c| c == (label, property)) {
            Some(index) => {
                constraints.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, PropertyId)> {
        self.constraints.read().clone()
    }

    /// Checks the committing transaction's final state of one vertex. The
    /// caller holds the vertex lock; the in-place state is the writer's own.
    pub(crate) fn validate(&self, vertex: &Vertex) -> Option<(LabelId, PropertyId)> {
        let constraints = self.constraints.read();
        if constraints.is_empty() {
            return None;
        }
        let data = vertex.data().read();
        if data.deleted {
            return None;
        }
        constraints
            .iter()
            .find(|(label, property)| {
                data.labels.contains(label) && !data.properties.has(*property)
            })
            .copied()
    }
}

#[derive(Debug)]
struct UniqueEntry {
    values: Vec<PropertyValue>,
    gid: Gid,
    timestamp: u64,
    /// `None` only in probe entries used as range bounds.
    vertex: Option<Arc<Vertex>>,
}

impl UniqueEntry {
    fn probe(values: Vec<PropertyValue>, gid: Gid, timestamp: u64) -> Self {
        Self {
            values,
            gid,
            timestamp,
            vertex: None,
        }
    }

    fn key(&self) -> (&[PropertyValue], Gid, u64) {
        (&self.values, self.gid, self.timestamp)
    }
}

impl PartialEq for UniqueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for UniqueEntry {}

impl PartialOrd for UniqueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UniqueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Whether any version of `vertex` reachable by a live transaction carries
/// `label` with exactly `values` for `keys`. The multi-property sibling of
/// the single-probe walker the indexes use.
fn any_reachable_version_has_values(
    vertex: &Vertex,
    label: LabelId,
    keys: &[PropertyId],
    values: &[PropertyValue],
    oldest_active: u64,
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
    let matches = |deleted: bool, has_label: bool, current: &[PropertyValue]| {
        !deleted && has_label && current.iter().zip(values).all(|(a, b)| a == b)
    };
    if matches(deleted, has_label, &current) {
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
            DeltaAction::SetProperty { key, value } => {
                if let Some(index) = keys.iter().position(|k| k == key) {
                    current[index] = value.clone();
                }
            }
            _ => {}
        }
        if matches(deleted, has_label, &current) {
            return true;
        }
        cursor = delta.next();
    }
    false
}

/// Unique constraints `(label, {properties})`, each backed by a sorted set
/// of `(values, vertex, start timestamp)` entries. Entries for a committing
/// transaction are installed just before validation; validation reconstructs
/// every colliding vertex's state as of the commit timestamp.
#[derive(Debug, Default)]
pub struct UniqueConstraints {
    sets: RwLock<HashMap<(LabelId, Vec<PropertyId>), Arc<SkipSet<UniqueEntry>>>>,
}

/// Sorted, deduplicated canonical form of a property set.
fn canonicalize(properties: &[PropertyId]) -> Vec<PropertyId> {
    let unique: HashSet<_> = properties.iter().copied().collect();
    let mut keys: Vec<_> = unique.into_iter().collect();
    keys.sort();
    keys
}

impl UniqueConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constraint after scanning every vertex's current state
    /// for pre-existing duplicates. Runs under the exclusive storage lock.
    pub(crate) fn create(
        &self,
        label: LabelId,
        properties: &[PropertyId],
        vertices: &SkipMap<Gid, Arc<Vertex>>,
    ) -> Result<bool> {
        if properties.is_empty() {
            return Err(StorageError::InvalidArgument(
                "unique constraint needs at least one property".into(),
            ));
        }
        let keys = canonicalize(properties);
        if keys.len() > MAX_UNIQUE_CONSTRAINT_PROPERTIES {
            return Err(StorageError::InvalidArgument(format!(
                "unique constraint limited to {MAX_UNIQUE_CONSTRAINT_PROPERTIES} properties"
            )));
        }
        if self.sets.read().contains_key(&(label, keys.clone())) {
            return Ok(false);
        }
        let set = Arc::new(SkipSet::new());
        let mut seen: HashMap<Vec<PropertyValue>, Gid> = HashMap::new();
        for entry in vertices.iter() {
            let vertex = entry.value();
            let data = vertex.data().read();
            if data.deleted || !data.labels.contains(&label) {
                continue;
            }
            let Some(values) = data.properties.extract_property_values(&keys) else {
                continue;
            };
            if seen.insert(values.clone(), vertex.gid).is_some() {
                return Err(StorageError::ConstraintViolation {
                    kind: ConstraintKind::Unique,
                    label,
                    properties: keys,
                });
            }
            set.insert(UniqueEntry {
                values,
                gid: vertex.gid,
                timestamp: 0,
                vertex: Some(Arc::clone(vertex)),
            });
        }
        self.sets.write().insert((label, keys), set);
        Ok(true)
    }

    pub(crate) fn drop_constraint(&self, label: LabelId, properties: &[PropertyId]) -> bool {
        self.sets
            .write()
            .remove(&(label, canonicalize(properties)))
            .is_some()
    }

    pub(crate) fn list(&self) -> Vec<(LabelId, Vec<PropertyId>)> {
        let mut pairs: Vec<_> = self.sets.read().keys().cloned().collect();
        pairs.sort();
        pairs
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }

    /// Installs entries for one of the committing transaction's modified
    /// vertices. Runs under the commit-serialisation lock, before
    /// validation.
    pub(crate) fn update_before_commit(&self, vertex: &Arc<Vertex>, txn: &Transaction) {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .map(|((label, keys), set)| (*label, keys.clone(), Arc::clone(set)))
            .collect();
        if sets.is_empty() {
            return;
        }
        let data = vertex.data().read();
        if data.deleted {
            return;
        }
        for (label, keys, set) in sets {
            if !data.labels.contains(&label) {
                continue;
            }
            if let Some(values) = data.properties.extract_property_values(&keys) {
                set.insert(UniqueEntry {
                    values,
                    gid: vertex.gid,
                    timestamp: txn.start_timestamp,
                    vertex: Some(Arc::clone(vertex)),
                });
            }
        }
    }

    /// Looks for another vertex whose state as of `commit_timestamp` holds
    /// the same values. Returns the violated constraint if one is found.
    pub(crate) fn validate(
        &self,
        vertex: &Arc<Vertex>,
        txn: &Transaction,
        commit_timestamp: u64,
    ) -> Option<(LabelId, Vec<PropertyId>)> {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .map(|((label, keys), set)| (*label, keys.clone(), Arc::clone(set)))
            .collect();
        for (label, keys, set) in sets {
            let values = {
                let data = vertex.data().read();
                if data.deleted || !data.labels.contains(&label) {
                    continue;
                }
                match data.properties.extract_property_values(&keys) {
                    Some(values) => values,
                    None => continue,
                }
            };
            let range = (
                std::ops::Bound::Included(UniqueEntry::probe(values.clone(), Gid::from_u64(0), 0)),
                std::ops::Bound::Included(UniqueEntry::probe(
                    values.clone(),
                    Gid::from_u64(u64::MAX),
                    u64::MAX,
                )),
            );
            for entry in set.range(range) {
                let item = entry.value();
                if item.gid == vertex.gid {
                    continue;
                }
                let other = item.vertex.as_ref().expect("stored entries carry a vertex");
                if last_committed_version_satisfies(
                    other,
                    label,
                    &keys,
                    &values,
                    txn,
                    commit_timestamp,
                ) {
                    return Some((label, keys));
                }
            }
        }
        None
    }

    pub(crate) fn remove_obsolete_entries(&self, oldest_active: u64) {
        let sets: Vec<_> = self
            .sets
            .read()
            .iter()
            .map(|((label, keys), set)| (*label, keys.clone(), Arc::clone(set)))
            .collect();
        for (label, keys, set) in sets {
            for entry in set.iter() {
                let item = entry.value();
                let vertex = item.vertex.as_ref().expect("stored entries carry a vertex");
                if item.timestamp < oldest_active
                    && !any_reachable_version_has_values(
                        vertex,
                        label,
                        &keys,
                        &item.values,
                        oldest_active,
                    )
                {
                    entry.remove();
                }
            }
        }
    }
}
