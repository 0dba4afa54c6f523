use std::sync::Arc;

use crate::error::{Result, StorageError};
use crate::graph::edge::EdgeRef;
use crate::graph::vertex::Vertex;
use crate::ids::{EdgeTypeId, Gid, PropertyId};
use crate::mvcc::delta::DeltaAction;
use crate::mvcc::transaction::{Transaction, View};
use crate::mvcc::{apply_deltas_for_read, link_delta_edge, prepare_for_write};
use crate::props::PropertyValue;
use crate::storage::vertex_accessor::VertexAccessor;
use crate::storage::Storage;

/// Per-transaction handle on one edge, carrying both endpoints.
pub struct EdgeAccessor<'a> {
    edge: EdgeRef,
    edge_type: EdgeTypeId,
    from: Arc<Vertex>,
    to: Arc<Vertex>,
    storage: &'a Storage,
    txn: &'a Transaction,
}

impl<'a> Clone for EdgeAccessor<'a> {
    fn clone(&self) -> Self {
        Self {
            edge: self.edge.clone(),
            edge_type: self.edge_type,
            from: Arc::clone(&self.from),
            to: Arc::clone(&self.to),
            storage: self.storage,
            txn: self.txn,
        }
    }
}

impl<'a> EdgeAccessor<'a> {
    pub(crate) fn new(
        edge: EdgeRef,
        edge_type: EdgeTypeId,
        from: Arc<Vertex>,
        to: Arc<Vertex>,
        storage: &'a Storage,
        txn: &'a Transaction,
    ) -> Self {
        Self {
            edge,
            edge_type,
            from,
            to,
            storage,
            txn,
        }
    }

    pub fn gid(&self) -> Gid {
        self.edge.gid()
    }

    pub fn edge_type(&self) -> EdgeTypeId {
        self.edge_type
    }

    pub(crate) fn edge_ref(&self) -> &EdgeRef {
        &self.edge
    }

    pub(crate) fn from_arc(&self) -> &Arc<Vertex> {
        &self.from
    }

    pub(crate) fn to_arc(&self) -> &Arc<Vertex> {
        &self.to
    }

    pub fn from_vertex(&self) -> VertexAccessor<'a> {
        VertexAccessor::new(Arc::clone(&self.from), self.storage, self.txn)
    }

    pub fn to_vertex(&self) -> VertexAccessor<'a> {
        VertexAccessor::new(Arc::clone(&self.to), self.storage, self.txn)
    }

    /// Sets a property and returns the previous value. Fails when the
    /// database was created without properties on edges.
    pub fn set_property(&self, key: PropertyId, value: PropertyValue) -> Result<PropertyValue> {
        if self.txn.must_abort() {
            return Err(StorageError::SerializationError);
        }
        let Some(edge) = self.edge.ptr() else {
            return Err(StorageError::PropertiesDisabled);
        };
        let mut data = edge.data().write();
        if !prepare_for_write(self.txn, &data.delta) {
            return Err(StorageError::SerializationError);
        }
        if data.deleted {
            return Err(StorageError::DeletedObject);
        }
        let old = data.properties.get(key);
        link_delta_edge(
            self.txn,
            edge,
            &mut data,
            DeltaAction::SetProperty {
                key,
                value: old.clone(),
            },
        );
        data.properties.set(key, &value);
        Ok(old)
    }

    pub fn get_property(&self, key: PropertyId, view: View) -> Result<PropertyValue> {
        let Some(edge) = self.edge.ptr() else {
            return Err(StorageError::PropertiesDisabled);
        };
        let (mut exists, mut deleted, mut value, head) = {
            let data = edge.data().read();
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
        let Some(edge) = self.edge.ptr() else {
            return Err(StorageError::PropertiesDisabled);
        };
        let (mut exists, mut deleted, mut properties, head) = {
            let data = edge.data().read();
            let map: std::collections::HashMap<PropertyId, PropertyValue> =
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
}
