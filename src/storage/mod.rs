pub mod accessor;
pub mod edge_accessor;
mod gc;
pub mod vertex_accessor;

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, GcType, SnapshotWalMode, TransactionConfig};
use crate::constraints::{ExistenceConstraints, UniqueConstraints};
use crate::durability::scheduler::PeriodicWorker;
use crate::durability::wal::{WalRecord, WalWriter};
use crate::durability::{self, DurabilityResources};
use crate::error::{ConstraintKind, Result, StorageError};
use crate::graph::edge::Edge;
use crate::graph::vertex::Vertex;
use crate::ids::{Gid, IdCounter, NameIdMapper};
use crate::index::{LabelIndex, LabelPropertyIndex};
use crate::mvcc::commit_log::CommitLog;
use crate::mvcc::delta::{Delta, DeltaAction, PreviousPtr, TRANSACTION_INITIAL_ID};
use crate::mvcc::transaction::{IsolationLevel, StorageMode, Transaction};

pub use accessor::StorageAccessor;
pub use edge_accessor::EdgeAccessor;
pub use vertex_accessor::VertexAccessor;

/// Sink the commit path hands freshly appended deltas to, together with the
/// commit timestamp. Delivery failure surfaces as
/// [`StorageError::ReplicationError`] but never rolls the commit back.
pub trait ReplicationSink: Send + Sync {
    fn deliver(
        &self,
        commit_timestamp: u64,
        records: &[WalRecord],
    ) -> std::result::Result<(), String>;
}

#[derive(Debug)]
struct EngineState {
    next_transaction_id: u64,
    next_timestamp: u64,
    last_commit_timestamp: u64,
}

#[derive(Debug)]
pub(crate) struct CommittedTransaction {
    pub(crate) commit_timestamp: u64,
    pub(crate) deltas: Vec<Arc<Delta>>,
}

pub(crate) enum DeltaOwner {
    Vertex(Arc<Vertex>),
    Edge(Arc<Edge>),
}

/// Walks a delta's back-pointers up to the object owning its chain.
pub(crate) fn delta_owner(delta: &Arc<Delta>) -> Option<DeltaOwner> {
    let mut cursor = delta.prev();
    loop {
        match cursor {
            PreviousPtr::Null => return None,
            PreviousPtr::Vertex(weak) => return weak.upgrade().map(DeltaOwner::Vertex),
            PreviousPtr::Edge(weak) => return weak.upgrade().map(DeltaOwner::Edge),
            PreviousPtr::Delta(weak) => match weak.upgrade() {
                Some(newer) => cursor = newer.prev(),
                None => return None,
            },
        }
    }
}

/// The storage engine: owns the vertex and edge skip-lists, the indexes and
/// constraints, the MVCC machinery, and the durability state. One instance
/// per data directory, enforced through the lock file.
pub struct Storage {
    pub(crate) config: Config,
    transaction_config: Mutex<TransactionConfig>,
    pub(crate) uuid: String,
    pub(crate) epoch_id: String,
    pub(crate) name_id_mapper: NameIdMapper,
    pub(crate) vertices: SkipMap<Gid, Arc<Vertex>>,
    pub(crate) edges: SkipMap<Gid, Arc<Edge>>,
    pub(crate) vertex_id: IdCounter,
    pub(crate) edge_id: IdCounter,
    pub(crate) edge_count: AtomicU64,
    engine: Mutex<EngineState>,
    pub(crate) commit_log: CommitLog,
    pub(crate) committed: Mutex<VecDeque<CommittedTransaction>>,
    /// Shared by every accessor; exclusive for schema operations.
    pub(crate) main_lock: RwLock<()>,
    /// Serialises unique-constraint validation, WAL emission and commit
    /// timestamp publication so the committed list stays sorted.
    commit_serialization_lock: Mutex<()>,
    pub(crate) gc_lock: Mutex<()>,
    pub(crate) label_index: LabelIndex,
    pub(crate) label_property_index: LabelPropertyIndex,
    pub(crate) existence_constraints: ExistenceConstraints,
    pub(crate) unique_constraints: UniqueConstraints,
    pub(crate) deleted_vertices: Mutex<Vec<Gid>>,
    pub(crate) deleted_edges: Mutex<Vec<Gid>>,
    /// Delta buffers detached from their chains, tagged with the timestamp
    /// at which they were handed over; freed once no reader can reach them.
    pub(crate) garbage_deltas: Mutex<VecDeque<(u64, Vec<Arc<Delta>>)>>,
    pub(crate) gc_full_scan_vertices: AtomicBool,
    pub(crate) gc_full_scan_edges: AtomicBool,
    pub(crate) wal: Mutex<Option<WalWriter>>,
    pub(crate) durability: Option<DurabilityResources>,
    replication_sink: RwLock<Option<Arc<dyn ReplicationSink>>>,
}

impl Storage {
    pub(crate) fn new(config: Config) -> Self {
        let uuid = Uuid::new_v4().to_string();
        let epoch_id = Uuid::new_v4().to_string();
        Self {
            transaction_config: Mutex::new(config.transaction.clone()),
            config,
            uuid,
            epoch_id,
            name_id_mapper: NameIdMapper::new(),
            vertices: SkipMap::new(),
            edges: SkipMap::new(),
            vertex_id: IdCounter::new(0),
            edge_id: IdCounter::new(0),
            edge_count: AtomicU64::new(0),
            engine: Mutex::new(EngineState {
                next_transaction_id: TRANSACTION_INITIAL_ID,
                next_timestamp: 1,
                last_commit_timestamp: 0,
            }),
            commit_log: CommitLog::new(),
            committed: Mutex::new(VecDeque::new()),
            main_lock: RwLock::new(()),
            commit_serialization_lock: Mutex::new(()),
            gc_lock: Mutex::new(()),
            label_index: LabelIndex::new(),
            label_property_index: LabelPropertyIndex::new(),
            existence_constraints: ExistenceConstraints::new(),
            unique_constraints: UniqueConstraints::new(),
            deleted_vertices: Mutex::new(Vec::new()),
            deleted_edges: Mutex::new(Vec::new()),
            garbage_deltas: Mutex::new(VecDeque::new()),
            gc_full_scan_vertices: AtomicBool::new(false),
            gc_full_scan_edges: AtomicBool::new(false),
            wal: Mutex::new(None),
            durability: None,
            replication_sink: RwLock::new(None),
        }
    }

    pub fn properties_on_edges(&self) -> bool {
        self.config.items.properties_on_edges
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> u64 {
        self.edge_count.load(Ordering::Acquire)
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.transaction_config.lock().storage_mode
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.transaction_config.lock().isolation_level
    }

    /// Changing the isolation level is refused in analytical mode, which
    /// provides no isolation to change.
    pub fn set_isolation_level(&self, level: IsolationLevel) -> Result<()> {
        let mut config = self.transaction_config.lock();
        if config.storage_mode == StorageMode::InMemoryAnalytical {
            return Err(StorageError::WrongMode("analytical"));
        }
        config.isolation_level = level;
        Ok(())
    }

    /// Switches the storage mode. Waits for every accessor to finish.
    pub fn set_storage_mode(&self, mode: StorageMode) {
        let _unique = self.main_lock.write();
        self.transaction_config.lock().storage_mode = mode;
    }

    pub fn set_replication_sink(&self, sink: Arc<dyn ReplicationSink>) {
        *self.replication_sink.write() = Some(sink);
    }

    pub(crate) fn peek_timestamp(&self) -> u64 {
        self.engine.lock().next_timestamp
    }

    /// Seeds the engine counters after recovery.
    pub(crate) fn restore_counters(&self, next_timestamp: u64, last_commit_timestamp: u64) {
        let mut engine = self.engine.lock();
        engine.next_timestamp = engine.next_timestamp.max(next_timestamp);
        engine.last_commit_timestamp = engine.last_commit_timestamp.max(last_commit_timestamp);
    }

    /// Opens a transactional accessor. The accessor holds the shared
    /// storage lock for its whole lifetime and aborts on drop unless
    /// committed.
    pub fn access(&self) -> StorageAccessor<'_> {
        self.access_with(None)
    }

    pub fn access_with(&self, isolation_override: Option<IsolationLevel>) -> StorageAccessor<'_> {
        let guard = self.main_lock.read();
        let (isolation, mode) = {
            let config = self.transaction_config.lock();
            (
                isolation_override.unwrap_or(config.isolation_level),
                config.storage_mode,
            )
        };
        let (transaction_id, start_timestamp) = {
            let mut engine = self.engine.lock();
            let id = engine.next_transaction_id;
            engine.next_transaction_id += 1;
            let ts = engine.next_timestamp;
            engine.next_timestamp += 1;
            (id, ts)
        };
        self.commit_log.register(start_timestamp);
        debug!(transaction_id, start_timestamp, "transaction started");
        StorageAccessor::new(
            self,
            guard,
            Transaction::new(transaction_id, start_timestamp, isolation, mode),
        )
    }

    /// Replica-side accessor: starts at the last committed timestamp rather
    /// than a fresh one, preserving snapshot isolation against main-side
    /// writes.
    pub fn replica_access(&self) -> StorageAccessor<'_> {
        let guard = self.main_lock.read();
        let (isolation, mode) = {
            let config = self.transaction_config.lock();
            (config.isolation_level, config.storage_mode)
        };
        let (transaction_id, start_timestamp) = {
            let mut engine = self.engine.lock();
            let id = engine.next_transaction_id;
            engine.next_transaction_id += 1;
            (id, engine.last_commit_timestamp)
        };
        self.commit_log.register(start_timestamp);
        StorageAccessor::new(
            self,
            guard,
            Transaction::new(transaction_id, start_timestamp, isolation, mode),
        )
    }

    // ---- commit / abort ---------------------------------------------------

    pub(crate) fn commit_transaction(
        &self,
        txn: &Transaction,
        desired_commit_timestamp: Option<u64>,
    ) -> Result<()> {
        if txn.must_abort() {
            self.abort_transaction(txn);
            return Err(StorageError::SerializationError);
        }
        if !txn.has_deltas() {
            self.commit_log.mark_finished(txn.start_timestamp);
            return Ok(());
        }

        // Existence constraints check the transaction's own final state and
        // need no timestamp; validate before anything is published.
        let modified: Vec<Arc<Vertex>> = txn.modified_vertices.lock().values().cloned().collect();
        for vertex in &modified {
            if let Some((label, property)) = self.existence_constraints.validate(vertex) {
                self.abort_transaction(txn);
                return Err(StorageError::ConstraintViolation {
                    kind: ConstraintKind::Existence,
                    label,
                    properties: vec![property],
                });
            }
        }

        let commit_guard = self.commit_serialization_lock.lock();
        let commit_timestamp = {
            let mut engine = self.engine.lock();
            match desired_commit_timestamp {
                Some(ts) => {
                    engine.next_timestamp = engine.next_timestamp.max(ts + 1);
                    ts
                }
                None => {
                    let ts = engine.next_timestamp;
                    engine.next_timestamp += 1;
                    ts
                }
            }
        };

        if !self.unique_constraints.is_empty() {
            for vertex in &modified {
                self.unique_constraints.update_before_commit(vertex, txn);
            }
            for vertex in &modified {
                if let Some((label, properties)) =
                    self.unique_constraints.validate(vertex, txn, commit_timestamp)
                {
                    drop(commit_guard);
                    self.abort_transaction(txn);
                    return Err(StorageError::ConstraintViolation {
                        kind: ConstraintKind::Unique,
                        label,
                        properties,
                    });
                }
            }
        }

        let needs_records =
            self.wal.lock().is_some() || self.replication_sink.read().is_some();
        let records = if needs_records {
            self.wal_records_for(txn)
        } else {
            Vec::new()
        };

        if let Some(wal) = self.wal.lock().as_mut() {
            if let Err(error) = wal.append_transaction(&records, commit_timestamp) {
                warn!(%error, "WAL append failed, aborting the commit");
                drop(commit_guard);
                self.abort_transaction(txn);
                return Err(error);
            }
        }

        let replication_error = self
            .replication_sink
            .read()
            .as_ref()
            .and_then(|sink| sink.deliver(commit_timestamp, &records).err());

        txn.commit_timestamp
            .store(commit_timestamp, Ordering::Release);
        {
            let mut engine = self.engine.lock();
            engine.last_commit_timestamp = commit_timestamp;
        }
        self.commit_log.mark_finished(txn.start_timestamp);
        self.committed.lock().push_back(CommittedTransaction {
            commit_timestamp,
            deltas: std::mem::take(&mut *txn.deltas.lock()),
        });
        drop(commit_guard);
        debug!(
            transaction_id = txn.transaction_id,
            commit_timestamp, "transaction committed"
        );

        match replication_error {
            Some(message) => Err(StorageError::ReplicationError(message)),
            None => Ok(()),
        }
    }

    /// Undoes every forward mutation by replaying the delta buffer in
    /// reverse, then unlinks the transaction's deltas from the chains they
    /// head. Objects whose creation is undone are queued for reclamation.
    pub(crate) fn abort_transaction(&self, txn: &Transaction) {
        let deltas = std::mem::take(&mut *txn.deltas.lock());
        for delta in deltas.iter().rev() {
            match delta.prev() {
                PreviousPtr::Vertex(weak) => {
                    let Some(vertex) = weak.upgrade() else { continue };
                    let mut data = vertex.data().write();
                    match &delta.action {
                        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => {
                            data.deleted = true;
                            self.deleted_vertices.lock().push(vertex.gid);
                        }
                        DeltaAction::RecreateObject => data.deleted = false,
                        DeltaAction::AddLabel(label) => data.labels.push(*label),
                        DeltaAction::RemoveLabel(label) => {
                            if let Some(index) = data.labels.iter().position(|l| l == label) {
                                data.labels.swap_remove(index);
                            }
                        }
                        DeltaAction::SetProperty { key, value } => {
                            data.properties.set(*key, value);
                        }
                        DeltaAction::AddInEdge(link) => {
                            data.in_edges.push(crate::graph::vertex::EdgeEntry {
                                edge_type: link.edge_type,
                                vertex: Arc::clone(&link.vertex),
                                edge: link.edge.clone(),
                            });
                        }
                        DeltaAction::RemoveInEdge(link) => {
                            crate::graph::vertex::remove_edge_entry(
                                &mut data.in_edges,
                                link.edge_type,
                                &link.vertex,
                                &link.edge,
                            );
                        }
                        DeltaAction::AddOutEdge(link) => {
                            data.out_edges.push(crate::graph::vertex::EdgeEntry {
                                edge_type: link.edge_type,
                                vertex: Arc::clone(&link.vertex),
                                edge: link.edge.clone(),
                            });
                            self.edge_count.fetch_add(1, Ordering::AcqRel);
                        }
                        DeltaAction::RemoveOutEdge(link) => {
                            crate::graph::vertex::remove_edge_entry(
                                &mut data.out_edges,
                                link.edge_type,
                                &link.vertex,
                                &link.edge,
                            );
                            self.edge_count.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                    data.delta = delta.next();
                    if let Some(next) = &data.delta {
                        next.set_prev(PreviousPtr::Vertex(Arc::downgrade(&vertex)));
                    }
                }
                PreviousPtr::Edge(weak) => {
                    let Some(edge) = weak.upgrade() else { continue };
                    let mut data = edge.data().write();
                    match &delta.action {
                        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => {
                            data.deleted = true;
                            self.deleted_edges.lock().push(edge.gid);
                        }
                        DeltaAction::RecreateObject => data.deleted = false,
                        DeltaAction::SetProperty { key, value } => {
                            data.properties.set(*key, value);
                        }
                        _ => {}
                    }
                    data.delta = delta.next();
                    if let Some(next) = &data.delta {
                        next.set_prev(PreviousPtr::Edge(Arc::downgrade(&edge)));
                    }
                }
                // Own deltas always sit at the head of their chains while
                // the transaction is active, so by the time a delta is
                // processed its back-pointer names the owner.
                PreviousPtr::Delta(_) | PreviousPtr::Null => {}
            }
        }
        self.commit_log.mark_finished(txn.start_timestamp);
        if !deltas.is_empty() {
            let mark = self.peek_timestamp();
            self.garbage_deltas.lock().push_back((mark, deltas));
        }
        debug!(transaction_id = txn.transaction_id, "transaction aborted");
    }

    // ---- WAL record derivation --------------------------------------------

    fn label_name(&self, label: crate::ids::LabelId) -> String {
        self.name_id_mapper
            .id_to_name(label.as_u64())
            .expect("interned label id resolves")
    }

    fn property_name(&self, property: crate::ids::PropertyId) -> String {
        self.name_id_mapper
            .id_to_name(property.as_u64())
            .expect("interned property id resolves")
    }

    fn edge_type_name(&self, edge_type: crate::ids::EdgeTypeId) -> String {
        self.name_id_mapper
            .id_to_name(edge_type.as_u64())
            .expect("interned edge type id resolves")
    }

    /// Derives the forward operations of a committing transaction from its
    /// undo records, grouped so a single forward replay pass reconstructs a
    /// consistent state: vertex creations, vertex mutations, edge creations,
    /// edge mutations, edge deletions, vertex deletions.
    pub(crate) fn wal_records_for(&self, txn: &Transaction) -> Vec<WalRecord> {
        let deltas = txn.deltas.lock();
        let mut vertex_creates = Vec::new();
        let mut vertex_ops = Vec::new();
        let mut edge_creates = Vec::new();
        let mut edge_ops = Vec::new();
        let mut edge_deletes = Vec::new();
        let mut vertex_deletes = Vec::new();

        for delta in deltas.iter() {
            let Some(owner) = delta_owner(delta) else { continue };
            match owner {
                DeltaOwner::Vertex(vertex) => {
                    let gid = vertex.gid;
                    match &delta.action {
                        DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => {
                            vertex_creates.push(WalRecord::VertexCreate { gid });
                        }
                        DeltaAction::RecreateObject => {
                            vertex_deletes.push(WalRecord::VertexDelete { gid });
                        }
                        DeltaAction::AddLabel(label) => {
                            vertex_ops.push(WalRecord::VertexRemoveLabel {
                                gid,
                                label: self.label_name(*label),
                            });
                        }
                        DeltaAction::RemoveLabel(label) => {
                            vertex_ops.push(WalRecord::VertexAddLabel {
                                gid,
                                label: self.label_name(*label),
                            });
                        }
                        DeltaAction::SetProperty { key, .. } => {
                            let value = vertex.data().read().properties.get(*key);
                            vertex_ops.push(WalRecord::VertexSetProperty {
                                gid,
                                key: self.property_name(*key),
                                value,
                            });
                        }
                        DeltaAction::RemoveOutEdge(link) => {
                            edge_creates.push(WalRecord::EdgeCreate {
                                gid: link.edge.gid(),
                                from: gid,
                                to: link.vertex.gid,
                                edge_type: self.edge_type_name(link.edge_type),
                            });
                            // A re-created owned edge keeps its properties;
                            // re-emit them so replay restores the full state.
                            if let Some(edge) = link.edge.ptr() {
                                for (key, value) in edge.data().read().properties.properties() {
                                    edge_ops.push(WalRecord::EdgeSetProperty {
                                        gid: edge.gid,
                                        key: self.property_name(key),
                                        value,
                                    });
                                }
                            }
                        }
                        DeltaAction::AddOutEdge(link) => {
                            edge_deletes.push(WalRecord::EdgeDelete {
                                gid: link.edge.gid(),
                                from: gid,
                                to: link.vertex.gid,
                                edge_type: self.edge_type_name(link.edge_type),
                            });
                        }
                        // The out-side records cover both directions.
                        DeltaAction::AddInEdge(_) | DeltaAction::RemoveInEdge(_) => {}
                    }
                }
                DeltaOwner::Edge(edge) => match &delta.action {
                    DeltaAction::SetProperty { key, .. } => {
                        let value = edge.data().read().properties.get(*key);
                        edge_ops.push(WalRecord::EdgeSetProperty {
                            gid: edge.gid,
                            key: self.property_name(*key),
                            value,
                        });
                    }
                    // Edge creation and deletion are derived from the
                    // adjacency deltas, which carry the endpoints.
                    _ => {}
                },
            }
        }

        let mut records = vertex_creates;
        records.append(&mut vertex_ops);
        records.append(&mut edge_creates);
        records.append(&mut edge_ops);
        records.append(&mut edge_deletes);
        records.append(&mut vertex_deletes);
        records
    }

    // ---- schema operations ------------------------------------------------

    fn schema_commit_timestamp(&self) -> u64 {
        let mut engine = self.engine.lock();
        let ts = engine.next_timestamp;
        engine.next_timestamp += 1;
        engine.last_commit_timestamp = ts;
        ts
    }

    fn append_schema_record(&self, record: WalRecord, commit_timestamp: u64) -> Result<()> {
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.append_schema(&record, commit_timestamp)?;
        }
        Ok(())
    }

    pub fn create_label_index(&self, label_name: &str) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        if !self.label_index.create(label, &self.vertices) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::LabelIndexCreate {
                label: label_name.to_owned(),
            },
            ts,
        )?;
        info!(label = label_name, "label index created");
        Ok(true)
    }

    pub fn drop_label_index(&self, label_name: &str) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        if !self.label_index.drop_index(label) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::LabelIndexDrop {
                label: label_name.to_owned(),
            },
            ts,
        )?;
        Ok(true)
    }

    pub fn create_label_property_index(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let property =
            crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(property_name));
        if !self.label_property_index.create(label, property, &self.vertices) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::LabelPropertyIndexCreate {
                label: label_name.to_owned(),
                property: property_name.to_owned(),
            },
            ts,
        )?;
        info!(
            label = label_name,
            property = property_name,
            "label-property index created"
        );
        Ok(true)
    }

    pub fn drop_label_property_index(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let property =
            crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(property_name));
        if !self.label_property_index.drop_index(label, property) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::LabelPropertyIndexDrop {
                label: label_name.to_owned(),
                property: property_name.to_owned(),
            },
            ts,
        )?;
        Ok(true)
    }

    pub fn create_existence_constraint(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let property =
            crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(property_name));
        if !self
            .existence_constraints
            .create(label, property, &self.vertices)?
        {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::ExistenceConstraintCreate {
                label: label_name.to_owned(),
                property: property_name.to_owned(),
            },
            ts,
        )?;
        Ok(true)
    }

    pub fn drop_existence_constraint(
        &self,
        label_name: &str,
        property_name: &str,
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let property =
            crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(property_name));
        if !self.existence_constraints.drop_constraint(label, property) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::ExistenceConstraintDrop {
                label: label_name.to_owned(),
                property: property_name.to_owned(),
            },
            ts,
        )?;
        Ok(true)
    }

    pub fn create_unique_constraint(
        &self,
        label_name: &str,
        property_names: &[&str],
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let properties: Vec<_> = property_names
            .iter()
            .map(|name| crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(name)))
            .collect();
        if !self
            .unique_constraints
            .create(label, &properties, &self.vertices)?
        {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::UniqueConstraintCreate {
                label: label_name.to_owned(),
                properties: property_names.iter().map(|s| (*s).to_owned()).collect(),
            },
            ts,
        )?;
        Ok(true)
    }

    pub fn drop_unique_constraint(
        &self,
        label_name: &str,
        property_names: &[&str],
    ) -> Result<bool> {
        let _unique = self.main_lock.write();
        let label = crate::ids::LabelId::from_u64(self.name_id_mapper.name_to_id(label_name));
        let properties: Vec<_> = property_names
            .iter()
            .map(|name| crate::ids::PropertyId::from_u64(self.name_id_mapper.name_to_id(name)))
            .collect();
        if !self.unique_constraints.drop_constraint(label, &properties) {
            return Ok(false);
        }
        let ts = self.schema_commit_timestamp();
        self.append_schema_record(
            WalRecord::UniqueConstraintDrop {
                label: label_name.to_owned(),
                properties: property_names.iter().map(|s| (*s).to_owned()).collect(),
            },
            ts,
        )?;
        Ok(true)
    }

    // ---- snapshots --------------------------------------------------------

    /// Writes a snapshot of the current committed state. Refused in
    /// analytical mode when driven by the periodic worker, since no
    /// consistent transaction can be taken there.
    pub fn create_snapshot(&self) -> Result<()> {
        if self.storage_mode() == StorageMode::InMemoryAnalytical {
            return Err(StorageError::WrongMode("analytical"));
        }
        let Some(resources) = &self.durability else {
            return Err(StorageError::InvalidArgument(
                "durability is not configured for this storage".into(),
            ));
        };
        if !self.config.durability.snapshot_wal_mode.snapshots_enabled() {
            return Err(StorageError::InvalidArgument(
                "snapshots are disabled".into(),
            ));
        }
        let accessor = self.access_with(Some(IsolationLevel::SnapshotIsolation));
        durability::snapshot::create(self, &accessor, &resources.paths)?;
        durability::enforce_snapshot_retention(
            &resources.paths,
            &self.uuid,
            self.config.durability.snapshot_retention_count,
        )?;
        Ok(())
    }

    /// Drops the storage's delta chains and adjacency vectors. Chains and
    /// adjacency form reference cycles between objects, so a plain drop of
    /// the skip-lists would leak everything still linked.
    fn teardown(&self) {
        if let Some(wal) = self.wal.lock().as_mut() {
            if let Err(error) = wal.finalize() {
                warn!(%error, "failed to finalize WAL on shutdown");
            }
        }
        self.committed.lock().clear();
        self.garbage_deltas.lock().clear();
        for entry in self.vertices.iter() {
            let mut data = entry.value().data().write();
            data.delta = None;
            data.in_edges.clear();
            data.out_edges.clear();
        }
        for entry in self.edges.iter() {
            entry.value().data().write().delta = None;
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owning handle around [`Storage`]: runs the background garbage-collection
/// and snapshot workers and stops them before the storage goes away.
pub struct Database {
    storage: Arc<Storage>,
    workers: Vec<PeriodicWorker>,
}

impl Database {
    pub fn open(config: Config) -> Result<Self> {
        let mut storage = Storage::new(config);
        durability::setup(&mut storage)?;
        let storage = Arc::new(storage);
        let mut workers = Vec::new();

        if storage.config.gc.gc_type == GcType::Periodic {
            let weak: Weak<Storage> = Arc::downgrade(&storage);
            workers.push(PeriodicWorker::spawn(
                "storage-gc",
                storage.config.gc.interval,
                move || {
                    if let Some(storage) = weak.upgrade() {
                        storage.collect_garbage();
                    }
                },
            ));
        }
        if storage.config.durability.snapshot_wal_mode != SnapshotWalMode::Disabled {
            let weak: Weak<Storage> = Arc::downgrade(&storage);
            workers.push(PeriodicWorker::spawn(
                "storage-snapshot",
                storage.config.durability.snapshot_interval,
                move || {
                    if let Some(storage) = weak.upgrade() {
                        if let Err(error) = storage.create_snapshot() {
                            warn!(%error, "periodic snapshot failed");
                        }
                    }
                },
            ));
        }

        Ok(Self { storage, workers })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

impl Deref for Database {
    type Target = Storage;

    fn deref(&self) -> &Self::Target {
        &self.storage
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.workers.clear();
        if self.storage.config.durability.snapshot_on_exit {
            if let Err(error) = self.storage.create_snapshot() {
                warn!(%error, "snapshot on exit failed");
            }
        }
    }
}
