use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Result, StorageError};
use crate::graph::edge::{Edge, EdgeRef};
use crate::graph::vertex::{remove_edge_entry, EdgeEntry, Vertex, VertexData};
use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::mvcc::delta::{DeltaAction, EdgeLink};
use crate::mvcc::transaction::{StorageMode, Transaction, View};
use crate::mvcc::{apply_deltas_for_read, link_delta_edge, link_delta_vertex, prepare_for_write};
use crate::props::PropertyValue;
use crate::storage::edge_accessor::EdgeAccessor;
use crate::storage::vertex_accessor::VertexAccessor;
use crate::storage::Storage;

/// Whether the vertex exists and is not deleted in the transaction's view.
pub(crate) fn vertex_visible(vertex: &Vertex, txn: &Transaction, view: View) -> bool {
    let (mut exists, mut deleted, head) = {
        let data = vertex.data().read();
        (true, data.deleted, data.delta.clone())
    };
    apply_deltas_for_read(txn, head, view, |action| match action {
        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
        DeltaAction::RecreateObject => deleted = false,
        _ => {}
    });
    exists && !deleted
}

/// Write guards over a set of vertices, acquired in ascending gid order with
/// duplicates collapsed, so multi-object operations cannot form lock cycles.
pub(crate) struct MultiVertexGuards<'g> {
    guards: Vec<(Gid, RwLockWriteGuard<'g, VertexData>)>,
}

impl<'g> MultiVertexGuards<'g> {
    pub(crate) fn lock(vertices: &[&'g Arc<Vertex>]) -> Self {
        let mut ordered: Vec<&'g Arc<Vertex>> = vertices.to_vec();
        ordered.sort_by_key(|v| v.gid);
        ordered.dedup_by_key(|v| v.gid);
        let guards = ordered
            .into_iter()
            .map(|vertex| (vertex.gid, vertex.data().write()))
            .collect();
        Self { guards }
    }

    pub(crate) fn data(&self, gid: Gid) -> &VertexData {
        let index = self
            .guards
            .iter()
            .position(|(g, _)| *g == gid)
            .expect("vertex is locked");
        &self.guards[index].1
    }

    pub(crate) fn data_mut(&mut self, gid: Gid) -> &mut VertexData {
        let index = self
            .guards
            .iter()
            .position(|(g, _)| *g == gid)
            .expect("vertex is locked");
        &mut self.guards[index].1
    }

    pub(crate) fn prepare_all(&self, txn: &Transaction) -> bool {
        self.guards
            .iter()
            .all(|(_, data)| prepare_for_write(txn, &data.delta))
    }
}

/// Per-transaction handle on the whole vertex and edge set. Holds the shared
/// storage lock for its lifetime; dropping it without committing aborts.
pub struct StorageAccessor<'a> {
    storage: &'a Storage,
    _guard: RwLockReadGuard<'a, ()>,
    transaction: Transaction,
    active: bool,
}

impl<'a> StorageAccessor<'a> {
    pub(crate) fn new(
        storage: &'a Storage,
        guard: RwLockReadGuard<'a, ()>,
        transaction: Transaction,
    ) -> Self {
        Self {
            storage,
            _guard: guard,
            transaction,
            active: true,
        }
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Interns a label name.
    pub fn label_id(&self, name: &str) -> LabelId {
        LabelId::from_u64(self.storage.name_id_mapper.name_to_id(name))
    }

    /// Interns a property-key name.
    pub fn property_id(&self, name: &str) -> PropertyId {
        PropertyId::from_u64(self.storage.name_id_mapper.name_to_id(name))
    }

    /// Interns an edge-type name.
    pub fn edge_type_id(&self, name: &str) -> EdgeTypeId {
        EdgeTypeId::from_u64(self.storage.name_id_mapper.name_to_id(name))
    }

    fn check_abort(&self) -> Result<()> {
        if self.transaction.must_abort() {
            return Err(StorageError::SerializationError);
        }
        Ok(())
    }

    // ---- vertices ---------------------------------------------------------

    /// Creates a vertex. The creation delta makes it invisible to any
    /// transaction whose view predates this one.
    pub fn create_vertex(&self) -> VertexAccessor<'_> {
        let gid = Gid::from_u64(self.storage.vertex_id.next());
        self.create_vertex_at(gid)
    }

    /// Replica-apply variant accepting an externally assigned gid.
    pub fn create_vertex_ex(&self, gid: Gid) -> Result<VertexAccessor<'_>> {
        if self.storage.vertices.contains_key(&gid) {
            return Err(StorageError::InvalidArgument(format!(
                "vertex {gid} already exists"
            )));
        }
        self.storage.vertex_id.raise_to(gid.as_u64() + 1);
        Ok(self.create_vertex_at(gid))
    }

    fn create_vertex_at(&self, gid: Gid) -> VertexAccessor<'_> {
        let vertex = Vertex::new(gid);
        {
            let mut data = vertex.data().write();
            link_delta_vertex(
                &self.transaction,
                &vertex,
                &mut data,
                DeltaAction::DeleteObject,
            );
        }
        self.storage.vertices.insert(gid, Arc::clone(&vertex));
        VertexAccessor::new(vertex, self.storage, &self.transaction)
    }

    pub fn find_vertex(&self, gid: Gid, view: View) -> Option<VertexAccessor<'_>> {
        let vertex = Arc::clone(self.storage.vertices.get(&gid)?.value());
        vertex_visible(&vertex, &self.transaction, view)
            .then(|| VertexAccessor::new(vertex, self.storage, &self.transaction))
    }

    /// All vertices visible under `view`, in gid order.
    pub fn vertices(&self, view: View) -> Vec<VertexAccessor<'_>> {
        self.storage
            .vertices
            .iter()
            .filter(|entry| vertex_visible(entry.value(), &self.transaction, view))
            .map(|entry| {
                VertexAccessor::new(Arc::clone(entry.value()), self.storage, &self.transaction)
            })
            .collect()
    }

    /// Vertices carrying `label`, served from the label index.
    pub fn vertices_by_label(&self, label: LabelId, view: View) -> Result<Vec<VertexAccessor<'_>>> {
        let found = self
            .storage
            .label_index
            .vertices(label, &self.transaction, view)
            .ok_or_else(|| {
                StorageError::InvalidArgument("label index does not exist".into())
            })?;
        Ok(found
            .into_iter()
            .map(|vertex| VertexAccessor::new(vertex, self.storage, &self.transaction))
            .collect())
    }

    /// Vertices carrying `label` with any value for `property`, ordered by
    /// that value.
    pub fn vertices_by_label_property(
        &self,
        label: LabelId,
        property: PropertyId,
        view: View,
    ) -> Result<Vec<VertexAccessor<'_>>> {
        self.vertices_by_label_property_range(label, property, Bound::Unbounded, Bound::Unbounded, view)
    }

    pub fn vertices_by_label_property_value(
        &self,
        label: LabelId,
        property: PropertyId,
        value: &PropertyValue,
        view: View,
    ) -> Result<Vec<VertexAccessor<'_>>> {
        let found = self
            .storage
            .label_property_index
            .vertices_by_value(label, property, value, &self.transaction, view)
            .ok_or_else(|| {
                StorageError::InvalidArgument("label-property index does not exist".into())
            })?;
        Ok(found
            .into_iter()
            .map(|vertex| VertexAccessor::new(vertex, self.storage, &self.transaction))
            .collect())
    }

    pub fn vertices_by_label_property_range(
        &self,
        label: LabelId,
        property: PropertyId,
        lower: Bound<PropertyValue>,
        upper: Bound<PropertyValue>,
        view: View,
    ) -> Result<Vec<VertexAccessor<'_>>> {
        let found = self
            .storage
            .label_property_index
            .vertices_in_range(label, property, lower, upper, &self.transaction, view)
            .ok_or_else(|| {
                StorageError::InvalidArgument("label-property index does not exist".into())
            })?;
        Ok(found
            .into_iter()
            .map(|vertex| VertexAccessor::new(vertex, self.storage, &self.transaction))
            .collect())
    }

    /// Deletes a vertex with no incident edges. `Ok(None)` when it is
    /// already deleted in this view.
    pub fn delete_vertex(&self, vertex: &VertexAccessor<'_>) -> Result<Option<VertexAccessor<'_>>> {
        self.check_abort()?;
        let vertex = Arc::clone(vertex.vertex_arc());
        let mut data = vertex.data().write();
        if !prepare_for_write(&self.transaction, &data.delta) {
            return Err(StorageError::SerializationError);
        }
        if data.deleted {
            return Ok(None);
        }
        if !data.in_edges.is_empty() || !data.out_edges.is_empty() {
            return Err(StorageError::VertexHasEdges);
        }
        link_delta_vertex(
            &self.transaction,
            &vertex,
            &mut data,
            DeltaAction::RecreateObject,
        );
        data.deleted = true;
        drop(data);
        self.note_vertex_deleted();
        self.transaction.invalidate_cached_adjacency(vertex.gid);
        Ok(Some(VertexAccessor::new(
            Arc::clone(&vertex),
            self.storage,
            &self.transaction,
        )))
    }

    /// Analytical deletions leave no deltas behind, so the collector needs
    /// a full sweep to find them.
    fn note_vertex_deleted(&self) {
        if self.transaction.storage_mode() == StorageMode::InMemoryAnalytical {
            self.storage
                .gc_full_scan_vertices
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }

    fn note_edge_deleted(&self) {
        if self.transaction.storage_mode() == StorageMode::InMemoryAnalytical {
            self.storage
                .gc_full_scan_edges
                .store(true, std::sync::atomic::Ordering::Release);
        }
    }

    /// Deletes a vertex together with its still-reachable incident edges.
    /// Returns the deleted vertex and edges, or `Ok(None)` when the vertex
    /// is already deleted in this view.
    pub fn detach_delete_vertex(
        &self,
        vertex: &VertexAccessor<'_>,
    ) -> Result<Option<(VertexAccessor<'_>, Vec<EdgeAccessor<'_>>)>> {
        self.check_abort()?;
        let vertex = Arc::clone(vertex.vertex_arc());
        let mut deleted_edges = Vec::new();
        loop {
            let (out_edges, in_edges) = {
                let mut data = vertex.data().write();
                if !prepare_for_write(&self.transaction, &data.delta) {
                    return Err(StorageError::SerializationError);
                }
                if data.deleted {
                    return Ok(None);
                }
                if data.out_edges.is_empty() && data.in_edges.is_empty() {
                    link_delta_vertex(
                        &self.transaction,
                        &vertex,
                        &mut data,
                        DeltaAction::RecreateObject,
                    );
                    data.deleted = true;
                    drop(data);
                    self.note_vertex_deleted();
                    self.transaction.invalidate_cached_adjacency(vertex.gid);
                    let accessor =
                        VertexAccessor::new(Arc::clone(&vertex), self.storage, &self.transaction);
                    return Ok(Some((accessor, deleted_edges)));
                }
                (data.out_edges.clone(), data.in_edges.clone())
            };
            for entry in out_edges {
                if let Some(edge) =
                    self.delete_edge_impl(entry.edge_type, &entry.edge, &vertex, &entry.vertex)?
                {
                    deleted_edges.push(edge);
                }
            }
            for entry in in_edges {
                if let Some(edge) =
                    self.delete_edge_impl(entry.edge_type, &entry.edge, &entry.vertex, &vertex)?
                {
                    deleted_edges.push(edge);
                }
            }
        }
    }

    /// Bulk deletion: the given edges go first, then every vertex together
    /// with whatever incident edges it still has. Returns the deleted
    /// vertices and edges.
    pub fn detach_delete(
        &self,
        vertices: &[&VertexAccessor<'_>],
        edges: &[&EdgeAccessor<'_>],
    ) -> Result<(Vec<VertexAccessor<'_>>, Vec<EdgeAccessor<'_>>)> {
        let mut deleted_vertices = Vec::new();
        let mut deleted_edges = Vec::new();
        for edge in edges {
            if let Some(deleted) = self.delete_edge(edge)? {
                deleted_edges.push(deleted);
            }
        }
        for vertex in vertices {
            if let Some((deleted, incident)) = self.detach_delete_vertex(vertex)? {
                deleted_vertices.push(deleted);
                deleted_edges.extend(incident);
            }
        }
        Ok((deleted_vertices, deleted_edges))
    }

    // ---- edges ------------------------------------------------------------

    /// Creates an edge between two vertices. Endpoint locks are taken in
    /// ascending gid order.
    pub fn create_edge(
        &self,
        from: &VertexAccessor<'_>,
        to: &VertexAccessor<'_>,
        edge_type: EdgeTypeId,
    ) -> Result<EdgeAccessor<'_>> {
        let gid = Gid::from_u64(self.storage.edge_id.next());
        self.create_edge_at(
            Arc::clone(from.vertex_arc()),
            Arc::clone(to.vertex_arc()),
            edge_type,
            gid,
        )
    }

    /// Replica-apply variant accepting an externally assigned gid.
    pub fn create_edge_ex(
        &self,
        from: &VertexAccessor<'_>,
        to: &VertexAccessor<'_>,
        edge_type: EdgeTypeId,
        gid: Gid,
    ) -> Result<EdgeAccessor<'_>> {
        self.storage.edge_id.raise_to(gid.as_u64() + 1);
        self.create_edge_at(
            Arc::clone(from.vertex_arc()),
            Arc::clone(to.vertex_arc()),
            edge_type,
            gid,
        )
    }

    fn create_edge_at(
        &self,
        from: Arc<Vertex>,
        to: Arc<Vertex>,
        edge_type: EdgeTypeId,
        gid: Gid,
    ) -> Result<EdgeAccessor<'_>> {
        self.check_abort()?;
        let mut guards = MultiVertexGuards::lock(&[&from, &to]);
        if !guards.prepare_all(&self.transaction) {
            return Err(StorageError::SerializationError);
        }
        if guards.data(from.gid).deleted || guards.data(to.gid).deleted {
            return Err(StorageError::DeletedObject);
        }

        let edge_ref = if self.storage.properties_on_edges() {
            let edge = Edge::new(gid);
            {
                let mut edge_data = edge.data().write();
                link_delta_edge(
                    &self.transaction,
                    &edge,
                    &mut edge_data,
                    DeltaAction::DeleteObject,
                );
            }
            self.storage.edges.insert(gid, Arc::clone(&edge));
            EdgeRef::Ptr(edge)
        } else {
            EdgeRef::Gid(gid)
        };

        let from_data = guards.data_mut(from.gid);
        link_delta_vertex(
            &self.transaction,
            &from,
            from_data,
            DeltaAction::RemoveOutEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&to),
                edge: edge_ref.clone(),
            }),
        );
        from_data.out_edges.push(EdgeEntry {
            edge_type,
            vertex: Arc::clone(&to),
            edge: edge_ref.clone(),
        });

        let to_data = guards.data_mut(to.gid);
        link_delta_vertex(
            &self.transaction,
            &to,
            to_data,
            DeltaAction::RemoveInEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&from),
                edge: edge_ref.clone(),
            }),
        );
        to_data.in_edges.push(EdgeEntry {
            edge_type,
            vertex: Arc::clone(&from),
            edge: edge_ref.clone(),
        });
        drop(guards);

        self.storage
            .edge_count
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        self.transaction.invalidate_cached_adjacency(from.gid);
        self.transaction.invalidate_cached_adjacency(to.gid);
        Ok(EdgeAccessor::new(
            edge_ref,
            edge_type,
            from,
            to,
            self.storage,
            &self.transaction,
        ))
    }

    /// Deletes an edge. `Ok(None)` when it is already gone in this view.
    pub fn delete_edge(&self, edge: &EdgeAccessor<'_>) -> Result<Option<EdgeAccessor<'_>>> {
        self.check_abort()?;
        self.delete_edge_impl(
            edge.edge_type(),
            edge.edge_ref(),
            edge.from_arc(),
            edge.to_arc(),
        )
    }

    fn delete_edge_impl(
        &self,
        edge_type: EdgeTypeId,
        edge_ref: &EdgeRef,
        from: &Arc<Vertex>,
        to: &Arc<Vertex>,
    ) -> Result<Option<EdgeAccessor<'_>>> {
        // The edge lock is acquired before the endpoint locks, matching
        // every other edge-first code path.
        let edge_ptr = edge_ref.ptr().map(Arc::clone);
        let mut edge_guard = edge_ptr.as_ref().map(|edge| edge.data().write());
        if let Some(guard) = &edge_guard {
            if !prepare_for_write(&self.transaction, &guard.delta) {
                return Err(StorageError::SerializationError);
            }
        }
        let mut guards = MultiVertexGuards::lock(&[from, to]);
        if !guards.prepare_all(&self.transaction) {
            return Err(StorageError::SerializationError);
        }
        if let Some(guard) = &edge_guard {
            if guard.deleted {
                return Ok(None);
            }
        }

        let removed_out =
            remove_edge_entry(&mut guards.data_mut(from.gid).out_edges, edge_type, to, edge_ref);
        let removed_in =
            remove_edge_entry(&mut guards.data_mut(to.gid).in_edges, edge_type, from, edge_ref);
        if removed_out != removed_in {
            return Err(StorageError::Corruption(
                "adjacency vectors out of sync".into(),
            ));
        }
        if !removed_out {
            return Ok(None);
        }

        link_delta_vertex(
            &self.transaction,
            from,
            guards.data_mut(from.gid),
            DeltaAction::AddOutEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(to),
                edge: edge_ref.clone(),
            }),
        );
        link_delta_vertex(
            &self.transaction,
            to,
            guards.data_mut(to.gid),
            DeltaAction::AddInEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(from),
                edge: edge_ref.clone(),
            }),
        );
        if let (Some(edge), Some(guard)) = (&edge_ptr, edge_guard.as_mut()) {
            link_delta_edge(&self.transaction, edge, guard, DeltaAction::RecreateObject);
            guard.deleted = true;
        }
        drop(guards);
        drop(edge_guard);

        self.storage
            .edge_count
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        self.note_edge_deleted();
        self.transaction.invalidate_cached_adjacency(from.gid);
        self.transaction.invalidate_cached_adjacency(to.gid);
        Ok(Some(EdgeAccessor::new(
            edge_ref.clone(),
            edge_type,
            Arc::clone(from),
            Arc::clone(to),
            self.storage,
            &self.transaction,
        )))
    }

    /// Re-targets the tail of an edge to `new_from`.
    pub fn edge_set_from(
        &self,
        edge: &EdgeAccessor<'_>,
        new_from: &VertexAccessor<'_>,
    ) -> Result<EdgeAccessor<'_>> {
        self.retarget_edge(edge, Arc::clone(new_from.vertex_arc()), true)
    }

    /// Re-targets the head of an edge to `new_to`.
    pub fn edge_set_to(
        &self,
        edge: &EdgeAccessor<'_>,
        new_to: &VertexAccessor<'_>,
    ) -> Result<EdgeAccessor<'_>> {
        self.retarget_edge(edge, Arc::clone(new_to.vertex_arc()), false)
    }

    fn retarget_edge(
        &self,
        edge: &EdgeAccessor<'_>,
        new_vertex: Arc<Vertex>,
        retarget_from: bool,
    ) -> Result<EdgeAccessor<'_>> {
        self.check_abort()?;
        let edge_type = edge.edge_type();
        let edge_ref = edge.edge_ref().clone();
        let old_from = Arc::clone(edge.from_arc());
        let old_to = Arc::clone(edge.to_arc());
        let (new_from, new_to) = if retarget_from {
            (Arc::clone(&new_vertex), Arc::clone(&old_to))
        } else {
            (Arc::clone(&old_from), Arc::clone(&new_vertex))
        };

        let edge_ptr = edge_ref.ptr().map(Arc::clone);
        let edge_guard = edge_ptr.as_ref().map(|edge| edge.data().write());
        if let Some(guard) = &edge_guard {
            if !prepare_for_write(&self.transaction, &guard.delta) {
                return Err(StorageError::SerializationError);
            }
            if guard.deleted {
                return Err(StorageError::DeletedObject);
            }
        }

        let mut guards = MultiVertexGuards::lock(&[&old_from, &old_to, &new_vertex]);
        if !guards.prepare_all(&self.transaction) {
            return Err(StorageError::SerializationError);
        }
        if guards.data(old_from.gid).deleted
            || guards.data(old_to.gid).deleted
            || guards.data(new_vertex.gid).deleted
        {
            return Err(StorageError::DeletedObject);
        }

        let removed_out = remove_edge_entry(
            &mut guards.data_mut(old_from.gid).out_edges,
            edge_type,
            &old_to,
            &edge_ref,
        );
        let removed_in = remove_edge_entry(
            &mut guards.data_mut(old_to.gid).in_edges,
            edge_type,
            &old_from,
            &edge_ref,
        );
        if !removed_out || !removed_in {
            return Err(StorageError::NonexistentObject);
        }

        link_delta_vertex(
            &self.transaction,
            &old_from,
            guards.data_mut(old_from.gid),
            DeltaAction::AddOutEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&old_to),
                edge: edge_ref.clone(),
            }),
        );
        link_delta_vertex(
            &self.transaction,
            &old_to,
            guards.data_mut(old_to.gid),
            DeltaAction::AddInEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&old_from),
                edge: edge_ref.clone(),
            }),
        );

        link_delta_vertex(
            &self.transaction,
            &new_from,
            guards.data_mut(new_from.gid),
            DeltaAction::RemoveOutEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&new_to),
                edge: edge_ref.clone(),
            }),
        );
        guards.data_mut(new_from.gid).out_edges.push(EdgeEntry {
            edge_type,
            vertex: Arc::clone(&new_to),
            edge: edge_ref.clone(),
        });
        link_delta_vertex(
            &self.transaction,
            &new_to,
            guards.data_mut(new_to.gid),
            DeltaAction::RemoveInEdge(EdgeLink {
                edge_type,
                vertex: Arc::clone(&new_from),
                edge: edge_ref.clone(),
            }),
        );
        guards.data_mut(new_to.gid).in_edges.push(EdgeEntry {
            edge_type,
            vertex: Arc::clone(&new_from),
            edge: edge_ref.clone(),
        });
        drop(guards);
        drop(edge_guard);

        self.transaction.invalidate_cached_adjacency(old_from.gid);
        self.transaction.invalidate_cached_adjacency(old_to.gid);
        self.transaction.invalidate_cached_adjacency(new_vertex.gid);
        Ok(EdgeAccessor::new(
            edge_ref,
            edge_type,
            new_from,
            new_to,
            self.storage,
            &self.transaction,
        ))
    }

    // ---- transaction boundary ---------------------------------------------

    pub fn commit(mut self) -> Result<()> {
        self.active = false;
        self.storage.commit_transaction(&self.transaction, None)
    }

    /// Replica-apply commit with an externally assigned commit timestamp.
    pub fn commit_with_timestamp(mut self, commit_timestamp: u64) -> Result<()> {
        self.active = false;
        self.storage
            .commit_transaction(&self.transaction, Some(commit_timestamp))
    }

    pub fn abort(mut self) {
        self.active = false;
        self.storage.abort_transaction(&self.transaction);
    }

    /// Handle external actors use to request an abort; the next write
    /// operation observes it.
    pub fn termination_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.transaction.must_abort)
    }
}

impl Drop for StorageAccessor<'_> {
    fn drop(&mut self) {
        if self.active {
            self.storage.abort_transaction(&self.transaction);
        }
    }
}
