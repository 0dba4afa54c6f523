use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::graph::vertex::{remove_edge_entry, EdgeEntry, Vertex};
use crate::ids::{Gid, LabelId, PropertyId};
use crate::mvcc::delta::DeltaAction;
use crate::mvcc::transaction::{Direction, Transaction, View};
use crate::mvcc::{apply_deltas_for_read, link_delta_vertex, prepare_for_write};
use crate::props::PropertyValue;
use crate::storage::edge_accessor::EdgeAccessor;
use crate::storage::Storage;

/// Per-transaction handle on one vertex. Reads reconstruct the state the
/// transaction's view selects by undoing the delta chain; writes install a
/// compensating delta first and mutate in place after.
pub struct VertexAccessor<'a> {
    vertex: Arc<Vertex>,
    storage: &'a Storage,
    txn: &'a Transaction,
}

impl<'a> Clone for VertexAccessor<'a> {
    fn clone(&self) -> Self {
        Self {
            vertex: Arc::clone(&self.vertex),
            storage: self.storage,
            txn: self.txn,
        }
    }
}

impl<'a> VertexAccessor<'a> {
    pub(crate) fn new(vertex: Arc<Vertex>, storage: &'a Storage, txn: &'a Transaction) -> Self {
        Self {
            vertex,
            storage,
            txn,
        }
    }

    pub fn gid(&self) -> Gid {
        self.vertex.gid
    }

    pub(crate) fn vertex_arc(&self) -> &Arc<Vertex> {
        &self.vertex
    }

    fn check_abort(&self) -> Result<()> {
        if self.txn.must_abort() {
            return Err(StorageError::SerializationError);
        }
        Ok(())
    }

    pub fn is_visible(&self, view: View) -> bool {
        crate::storage::accessor::vertex_visible(&self.vertex, self.txn, view)
    }

    /// Adds a label. `Ok(false)` when the vertex already carries it.
    pub fn add_label(&self, label: LabelId) -> Result<bool> {
        self.check_abort()?;
        let mut data = self.vertex.data().write();
        if !prepare_for_write(self.txn, &data.delta) {
            return Err(StorageError::SerializationError);
        }
        if data.deleted {
            return Err(StorageError::DeletedObject);
        }
        if data.labels.contains(&label) {
            return Ok(false);
        }
        link_delta_vertex(
            self.txn,
            &self.vertex,
            &mut data,
            DeltaAction::RemoveLabel(label),
        );
        data.labels.push(label);
        // Index entries are installed by the uncommitted operation itself;
        // iteration reconciles visibility against the delta chain.
        self.storage
            .label_index
            .update_on_add_label(label, &self.vertex, self.txn);
        self.storage.label_property_index.update_on_add_label(
            label,
            &self.vertex,
            &data.properties,
            self.txn,
        );
        Ok(true)
    }

    /// Removes a label. `Ok(false)` when the vertex does not carry it.
    pub fn remove_label(&self, label: LabelId) -> Result<bool> {
        self.check_abort()?;
        let mut data = self.vertex.data().write();
        if !prepare_for_write(self.txn, &data.delta) {
            return Err(StorageError::SerializationError);
        }
        if data.deleted {
            return Err(StorageError::DeletedObject);
        }
        let Some(index) = data.labels.iter().position(|l| *l == label) else {
            return Ok(false);
        };
        link_delta_vertex(
            self.txn,
            &self.vertex,
            &mut data,
            DeltaAction::AddLabel(label),
        );
        data.labels.swap_remove(index);
        Ok(true)
    }

    pub fn has_label(&self, label: LabelId, view: View) -> Result<bool> {
        let (mut exists, mut deleted, mut has_label, head) = {
            let data = self.vertex.data().read();
            (
                true,
                data.deleted,
                data.labels.contains(&label),
                data.delta.clone(),
            )
        };
        apply_deltas_for_read(self.txn, head, view, |action| match action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::AddLabel(l) if *l == label => has_label = true,
            DeltaAction::RemoveLabel(l) if *l == label => has_label = false,
            _ => {}
        });
        if !exists {
            return Err(StorageError::NonexistentObject);
        }
        if deleted {
            return Err(StorageError::DeletedObject);
        }
        Ok(has_label)
    }

    pub fn labels(&self, view: View) -> Result<Vec<LabelId>> {
        let (mut exists, mut deleted, mut labels, head) = {
            let data = self.vertex.data().read();
            (
                true,
                data.deleted,
                data.labels.to_vec(),
                data.delta.clone(),
            )
        };
        apply_deltas_for_read(self.txn, head, view, |action| match action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::AddLabel(l) => labels.push(*l),
            DeltaAction::RemoveLabel(l) => {
                if let Some(index) = labels.iter().position(|x| x == l) {
                    labels.swap_remove(index);
                }
            }
            _ => {}
        });
        if !exists {
            return Err(StorageError::NonexistentObject);
        }
        if deleted {
            return Err(StorageError::DeletedObject);
        }
        labels.sort();
        Ok(labels)
    }

    /// Sets a property and returns the previous value; `Null` removes the
    /// key.
    pub fn set_property(&self, key: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        self.check_abort()?;
        let mut data = self.vertex.data().write();
        if !prepare_for_write(self.txn, &data.delta) {
            return Err(StorageError::SerializationError);
        }
        if data.deleted {
            return Err(StorageError::DeletedObject);
        }
        let old = data.properties.get(key);
        link_delta_vertex(
            self.txn,
            &self.vertex,
            &mut data,
            DeltaAction::SetProperty {
                key,
                value: old.clone(),
            },
        );
        data.properties.set(key, &value);
        let labels: Vec<LabelId> = data.labels.to_vec();
        self.storage.label_property_index.update_on_set_property(
            key,
            &value,
            &self.vertex,
            &labels,
            self.txn,
        );
        Ok(old)
    }

    pub fn get_property(&self, key: PropertyId, view: View) -> Result<PropertyValue> {
        let (mut exists, mut deleted, mut value, head) = {
            let data = self.vertex.data().read();
            (
                true,
                data.deleted,
                data.properties.get(key),
                data.delta.clone(),
            )
        };
        apply_deltas_for_read(self.txn, head, view, |action| match action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::SetProperty { key: k, value: old } if *k == key => value = old.clone(),
            _ => {}
        });
        if !exists {
            return Err(StorageError::NonexistentObject);
        }
        if deleted {
            return Err(StorageError::DeletedObject);
        }
        Ok(value)
    }

    pub fn properties(&self, view: View) -> Result<Vec<(PropertyId, PropertyValue)>> {
        let (mut exists, mut deleted, mut properties, head) = {
            let data = self.vertex.data().read();
            let map: HashMap<PropertyId, PropertyValue> =
                data.properties.properties().into_iter().collect();
            (true, data.deleted, map, data.delta.clone())
        };
        apply_deltas_for_read(self.txn, head, view, |action| match action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::SetProperty { key, value } => {
                if value.is_null() {
                    properties.remove(key);
                } else {
                    properties.insert(*key, value.clone());
                }
            }
            _ => {}
        });
        if !exists {
            return Err(StorageError::NonexistentObject);
        }
        if deleted {
            return Err(StorageError::DeletedObject);
        }
        let mut out: Vec<_> = properties.into_iter().collect();
        out.sort_by_key(|(key, _)| *key);
        Ok(out)
    }

    fn materialized_edges(&self, direction: Direction, view: View) -> Result<Vec<EdgeEntry>> {
        if let Some(cached) = self
            .txn
            .adjacency_cache
            .lock()
            .get(self.vertex.gid, direction, view)
        {
            return Ok(cached.clone());
        }
        let (mut exists, mut deleted, mut edges, head) = {
            let data = self.vertex.data().read();
            let edges = match direction {
                Direction::In => data.in_edges.clone(),
                Direction::Out => data.out_edges.clone(),
            };
            (true, data.deleted, edges, data.delta.clone())
        };
        apply_deltas_for_read(self.txn, head, view, |action| match action {
            DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
            DeltaAction::RecreateObject => deleted = false,
            DeltaAction::AddInEdge(link) if direction == Direction::In => {
                edges.push(EdgeEntry {
                    edge_type: link.edge_type,
                    vertex: Arc::clone(&link.vertex),
                    edge: link.edge.clone(),
                });
            }
            DeltaAction::RemoveInEdge(link) if direction == Direction::In => {
                remove_edge_entry(&mut edges, link.edge_type, &link.vertex, &link.edge);
            }
            DeltaAction::AddOutEdge(link) if direction == Direction::Out => {
                edges.push(EdgeEntry {
                    edge_type: link.edge_type,
                    vertex: Arc::clone(&link.vertex),
                    edge: link.edge.clone(),
                });
            }
            DeltaAction::RemoveOutEdge(link) if direction == Direction::Out => {
                remove_edge_entry(&mut edges, link.edge_type, &link.vertex, &link.edge);
            }
            _ => {}
        });
        if !exists {
            return Err(StorageError::NonexistentObject);
        }
        if deleted {
            return Err(StorageError::DeletedObject);
        }
        self.txn
            .adjacency_cache
            .lock()
            .insert(self.vertex.gid, direction, view, edges.clone());
        Ok(edges)
    }

    pub fn out_edges(&self, view: View) -> Result<Vec<EdgeAccessor<'a>>> {
        Ok(self
            .materialized_edges(Direction::Out, view)?
            .into_iter()
            .map(|entry| {
                EdgeAccessor::new(
                    entry.edge,
                    entry.edge_type,
                    Arc::clone(&self.vertex),
                    entry.vertex,
                    self.storage,
                    self.txn,
                )
            })
            .collect())
    }

    pub fn in_edges(&self, view: View) -> Result<Vec<EdgeAccessor<'a>>> {
        Ok(self
            .materialized_edges(Direction::In, view)?
            .into_iter()
            .map(|entry| {
                EdgeAccessor::new(
                    entry.edge,
                    entry.edge_type,
                    entry.vertex,
                    Arc::clone(&self.vertex),
                    self.storage,
                    self.txn,
                )
            })
            .collect())
    }
}
