pub(crate) mod encoding;
pub(crate) mod scheduler;
pub(crate) mod snapshot;
pub mod wal;

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{info, warn};

use crate::error::{Result, StorageError};
use crate::graph::edge::{Edge, EdgeRef};
use crate::graph::vertex::{remove_edge_entry, EdgeEntry, Vertex};
use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::storage::Storage;
use wal::{WalEntry, WalRecord};

/// Resolved locations under the storage directory.
#[derive(Debug, Clone)]
pub(crate) struct DurabilityPaths {
    pub root: PathBuf,
    pub snapshots: PathBuf,
    pub wal: PathBuf,
    pub backup: PathBuf,
}

impl DurabilityPaths {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            snapshots: root.join("snapshots"),
            wal: root.join("wal"),
            backup: root.join(".backup"),
        }
    }
}

/// Held for the lifetime of the storage; the lock file guarantees a single
/// live instance per directory.
#[derive(Debug)]
pub(crate) struct DurabilityResources {
    pub paths: DurabilityPaths,
    _lock_file: File,
}

/// Schema descriptors accumulated from the snapshot and the WAL tail.
/// Materialised only after all data is in place, so indexes built mid-replay
/// cannot go stale against later records.
#[derive(Debug, Default)]
pub(crate) struct SchemaState {
    pub label_indexes: BTreeSet<u64>,
    pub label_property_indexes: BTreeSet<(u64, u64)>,
    pub existence_constraints: BTreeSet<(u64, u64)>,
    pub unique_constraints: BTreeSet<(u64, Vec<u64>)>,
}

impl SchemaState {
    fn apply_record(&mut self, storage: &Storage, record: &WalRecord) {
        let label_id = |name: &str| storage.name_id_mapper.name_to_id(name);
        match record {
            WalRecord::LabelIndexCreate { label } => {
                self.label_indexes.insert(label_id(label));
            }
            WalRecord::LabelIndexDrop { label } => {
                self.label_indexes.remove(&label_id(label));
            }
            WalRecord::LabelPropertyIndexCreate { label, property } => {
                self.label_property_indexes
                    .insert((label_id(label), label_id(property)));
            }
            WalRecord::LabelPropertyIndexDrop { label, property } => {
                self.label_property_indexes
                    .remove(&(label_id(label), label_id(property)));
            }
            WalRecord::ExistenceConstraintCreate { label, property } => {
                self.existence_constraints
                    .insert((label_id(label), label_id(property)));
            }
            WalRecord::ExistenceConstraintDrop { label, property } => {
                self.existence_constraints
                    .remove(&(label_id(label), label_id(property)));
            }
            WalRecord::UniqueConstraintCreate { label, properties } => {
                let mut ids: Vec<u64> = properties.iter().map(|p| label_id(p)).collect();
                ids.sort_unstable();
                self.unique_constraints.insert((label_id(label), ids));
            }
            WalRecord::UniqueConstraintDrop { label, properties } => {
                let mut ids: Vec<u64> = properties.iter().map(|p| label_id(p)).collect();
                ids.sort_unstable();
                self.unique_constraints.remove(&(label_id(label), ids));
            }
            _ => {}
        }
    }

    fn materialize(&self, storage: &Storage) -> Result<()> {
        for &label in &self.label_indexes {
            storage
                .label_index
                .create(LabelId::from_u64(label), &storage.vertices);
        }
        for &(label, property) in &self.label_property_indexes {
            storage.label_property_index.create(
                LabelId::from_u64(label),
                PropertyId::from_u64(property),
                &storage.vertices,
            );
        }
        for &(label, property) in &self.existence_constraints {
            storage.existence_constraints.create(
                LabelId::from_u64(label),
                PropertyId::from_u64(property),
                &storage.vertices,
            )?;
        }
        for (label, properties) in &self.unique_constraints {
            let ids: Vec<PropertyId> = properties.iter().map(|&p| PropertyId::from_u64(p)).collect();
            storage
                .unique_constraints
                .create(LabelId::from_u64(*label), &ids, &storage.vertices)?;
        }
        Ok(())
    }
}

/// Creates the directory layout, takes the exclusive lock, recovers or
/// backs aside existing data, and opens the WAL writer. Called once while
/// the storage is still exclusively owned.
pub(crate) fn setup(storage: &mut Storage) -> Result<()> {
    let config = storage.config.durability.clone();
    if !config.snapshot_wal_mode.snapshots_enabled() && !config.recover_on_startup {
        return Ok(());
    }
    let paths = DurabilityPaths::new(&config.storage_directory);
    std::fs::create_dir_all(&paths.root)?;
    std::fs::create_dir_all(&paths.snapshots)?;
    std::fs::create_dir_all(&paths.wal)?;

    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(paths.root.join("lock"))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        StorageError::InvalidArgument(format!(
            "storage directory {} is locked by another running instance",
            paths.root.display()
        ))
    })?;

    if config.recover_on_startup {
        recover(storage, &paths)?;
    } else if directory_has_entries(&paths.snapshots)? || directory_has_entries(&paths.wal)? {
        move_to_backup(&paths)?;
        warn!(
            root = %paths.root.display(),
            "existing durability files moved to .backup because recovery was not requested"
        );
    }

    if config.snapshot_wal_mode.wal_enabled() {
        let sequence = next_wal_sequence(&paths.wal)?;
        let writer = wal::WalWriter::open(
            &paths.wal,
            &storage.uuid,
            &storage.epoch_id,
            sequence,
            config.wal_file_size_kibibytes,
            config.wal_file_flush_every_n_tx,
        )?;
        *storage.wal.lock() = Some(writer);
    }

    storage.durability = Some(DurabilityResources {
        paths,
        _lock_file: lock_file,
    });
    Ok(())
}

fn directory_has_entries(path: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_some())
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn move_to_backup(paths: &DurabilityPaths) -> Result<()> {
    let target = paths.backup.join(format!("{:020}", unix_millis()));
    std::fs::create_dir_all(&target)?;
    std::fs::rename(&paths.snapshots, target.join("snapshots"))?;
    std::fs::rename(&paths.wal, target.join("wal"))?;
    std::fs::create_dir_all(&paths.snapshots)?;
    std::fs::create_dir_all(&paths.wal)?;
    Ok(())
}

fn next_wal_sequence(wal_dir: &Path) -> Result<u64> {
    let mut next = 0;
    for entry in std::fs::read_dir(wal_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "wal") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(sequence) = stem.parse::<u64>() {
                    next = next.max(sequence + 1);
                }
            }
        }
    }
    Ok(next)
}

/// Deletes the oldest snapshots of the given lineage beyond the retention
/// count. Snapshots of unrelated lineages are left alone.
pub(crate) fn enforce_snapshot_retention(
    paths: &DurabilityPaths,
    uuid: &str,
    retention_count: usize,
) -> Result<()> {
    let files = snapshot::list_snapshot_files(paths)?;
    let mut kept = 0usize;
    for path in files {
        let header = match snapshot::read_header(&path) {
            Ok(header) => header,
            Err(_) => continue,
        };
        if header.uuid != uuid {
            continue;
        }
        kept += 1;
        if kept > retention_count.max(1) {
            if let Err(error) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), %error, "failed to delete retired snapshot");
            }
        }
    }
    Ok(())
}

/// Recovery: newest valid snapshot of the current lineage, then the
/// matching WAL tail replayed on top of it.
fn recover(storage: &mut Storage, paths: &DurabilityPaths) -> Result<()> {
    let snapshot_files = snapshot::list_snapshot_files(paths)?;
    let mut headers = Vec::new();
    for path in &snapshot_files {
        match snapshot::read_header(path) {
            Ok(header) => headers.push((path.clone(), header)),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping snapshot with unreadable header");
            }
        }
    }

    // The newest readable snapshot names the lineage being recovered.
    let current_uuid = headers.first().map(|(_, h)| h.uuid.clone());
    let mut loaded = None;
    if let Some(uuid) = &current_uuid {
        for (path, header) in headers.iter().filter(|(_, h)| h.uuid == *uuid) {
            match snapshot::load(storage, path) {
                Ok(info) => {
                    loaded = Some(info);
                    break;
                }
                Err(StorageError::Corruption(message)) => {
                    warn!(
                        path = %path.display(),
                        message,
                        last_commit_timestamp = header.last_commit_timestamp,
                        "snapshot failed validation, falling back to an older one"
                    );
                }
                Err(error) => return Err(error),
            }
        }
        if loaded.is_none() {
            return Err(StorageError::Corruption(format!(
                "every snapshot of database lineage {uuid} is corrupt"
            )));
        }
    }

    let mut schema = SchemaState::default();
    let mut snapshot_timestamp = 0;
    let mut last_timestamp = 0;
    let mut max_vertex_gid = None;
    let mut max_edge_gid = None;
    let mut edge_count: i64 = 0;
    let mut recovered_uuid = current_uuid;

    if let Some(info) = loaded {
        snapshot_timestamp = info.header.last_commit_timestamp;
        last_timestamp = info.header.last_commit_timestamp;
        schema = info.schema;
        max_vertex_gid = info.max_vertex_gid;
        max_edge_gid = info.max_edge_gid;
        edge_count = info.edge_count as i64;
        storage.epoch_id = info.header.epoch_id.clone();
    }

    // WAL tail.
    let mut infos = Vec::new();
    for entry in std::fs::read_dir(&paths.wal)? {
        let path = entry?.path();
        if !path.extension().is_some_and(|ext| ext == "wal") {
            continue;
        }
        match wal::read_info(&path) {
            Ok(info) => infos.push(info),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping WAL file with unreadable header");
            }
        }
    }
    if recovered_uuid.is_none() {
        // No snapshot: the newest WAL names the lineage.
        recovered_uuid = infos
            .iter()
            .max_by_key(|info| info.sequence)
            .map(|info| info.uuid.clone());
    }
    if let Some(uuid) = &recovered_uuid {
        infos.retain(|info| info.uuid == *uuid);
    }
    infos.sort_by_key(|info| info.sequence);

    let needed: Vec<_> = infos
        .iter()
        .filter(|info| {
            !info.finalized || info.last_timestamp.is_some_and(|ts| ts > snapshot_timestamp)
        })
        .collect();
    for window in needed.windows(2) {
        if window[1].sequence != window[0].sequence + 1 {
            return Err(StorageError::Corruption(format!(
                "WAL sequence gap between {} and {}; committed state would be lost",
                window[0].sequence, window[1].sequence
            )));
        }
    }

    let mut refcounts: HashMap<u64, i64> = HashMap::new();
    for entry in storage.vertices.iter() {
        for edge_entry in &entry.value().data().read().out_edges {
            *refcounts.entry(edge_entry.edge.gid().as_u64()).or_insert(0) += 1;
        }
    }

    let mut applied_transactions = 0u64;
    for (position, info) in needed.iter().enumerate() {
        let is_last = position + 1 == needed.len();
        let (entries, clean) = wal::read_records(&info.path)?;
        if !clean && !is_last {
            return Err(StorageError::Corruption(format!(
                "WAL file {} is corrupt in the middle of the recovery range",
                info.path.display()
            )));
        }
        let mut pending: Vec<WalEntry> = Vec::new();
        for entry in entries {
            if entry.record.is_schema() {
                if entry.commit_timestamp > snapshot_timestamp {
                    schema.apply_record(storage, &entry.record);
                    last_timestamp = last_timestamp.max(entry.commit_timestamp);
                }
                continue;
            }
            if entry.record == WalRecord::TransactionEnd {
                if entry.commit_timestamp > snapshot_timestamp {
                    for buffered in pending.drain(..) {
                        apply_data_record(
                            storage,
                            &buffered.record,
                            &mut refcounts,
                            &mut max_vertex_gid,
                            &mut max_edge_gid,
                            &mut edge_count,
                        )?;
                    }
                    last_timestamp = last_timestamp.max(entry.commit_timestamp);
                    applied_transactions += 1;
                } else {
                    pending.clear();
                }
                continue;
            }
            pending.push(entry);
        }
        if !pending.is_empty() {
            if !is_last {
                return Err(StorageError::Corruption(format!(
                    "WAL file {} ends inside a transaction",
                    info.path.display()
                )));
            }
            warn!(
                path = %info.path.display(),
                records = pending.len(),
                "discarding incomplete transaction at the WAL tail"
            );
        }
    }

    schema.materialize(storage)?;

    if let Some(uuid) = recovered_uuid {
        storage.uuid = uuid;
    }
    if let Some(max) = max_vertex_gid {
        storage.vertex_id.raise_to(max + 1);
    }
    if let Some(max) = max_edge_gid {
        storage.edge_id.raise_to(max + 1);
    }
    storage
        .edge_count
        .store(edge_count.max(0) as u64, Ordering::Release);
    storage.restore_counters(last_timestamp + 1, last_timestamp);

    info!(
        vertices = storage.vertices.len(),
        edges = edge_count,
        applied_transactions,
        last_timestamp,
        "recovery finished"
    );
    Ok(())
}

fn mapper_label(storage: &Storage, name: &str) -> LabelId {
    LabelId::from_u64(storage.name_id_mapper.name_to_id(name))
}

fn mapper_property(storage: &Storage, name: &str) -> PropertyId {
    PropertyId::from_u64(storage.name_id_mapper.name_to_id(name))
}

fn mapper_edge_type(storage: &Storage, name: &str) -> EdgeTypeId {
    EdgeTypeId::from_u64(storage.name_id_mapper.name_to_id(name))
}

fn replay_vertex(storage: &Storage, gid: Gid) -> Result<Arc<Vertex>> {
    storage
        .vertices
        .get(&gid)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| StorageError::Corruption(format!("WAL references missing vertex {gid}")))
}

/// Applies one committed data record. Objects are installed without deltas,
/// exactly as a snapshot load would leave them.
fn apply_data_record(
    storage: &Storage,
    record: &WalRecord,
    refcounts: &mut HashMap<u64, i64>,
    max_vertex_gid: &mut Option<u64>,
    max_edge_gid: &mut Option<u64>,
    edge_count: &mut i64,
) -> Result<()> {
    match record {
        WalRecord::VertexCreate { gid } => {
            *max_vertex_gid = (*max_vertex_gid).max(Some(gid.as_u64()));
            storage.vertices.insert(*gid, Vertex::new(*gid));
        }
        WalRecord::VertexDelete { gid } => {
            storage.vertices.remove(gid);
        }
        WalRecord::VertexAddLabel { gid, label } => {
            let label = mapper_label(storage, label);
            let vertex = replay_vertex(storage, *gid)?;
            let mut data = vertex.data().write();
            if !data.labels.contains(&label) {
                data.labels.push(label);
            }
        }
        WalRecord::VertexRemoveLabel { gid, label } => {
            let label = mapper_label(storage, label);
            let vertex = replay_vertex(storage, *gid)?;
            let mut data = vertex.data().write();
            if let Some(index) = data.labels.iter().position(|l| *l == label) {
                data.labels.swap_remove(index);
            }
        }
        WalRecord::VertexSetProperty { gid, key, value } => {
            let key = mapper_property(storage, key);
            let vertex = replay_vertex(storage, *gid)?;
            vertex.data().write().properties.set(key, value);
        }
        WalRecord::EdgeCreate {
            gid,
            from,
            to,
            edge_type,
        } => {
            *max_edge_gid = (*max_edge_gid).max(Some(gid.as_u64()));
            let edge_type = mapper_edge_type(storage, edge_type);
            let from_vertex = replay_vertex(storage, *from)?;
            let to_vertex = replay_vertex(storage, *to)?;
            let edge_ref = if storage.properties_on_edges() {
                let edge = match storage.edges.get(gid) {
                    Some(entry) => Arc::clone(entry.value()),
                    None => {
                        let edge = Edge::new(*gid);
                        storage.edges.insert(*gid, Arc::clone(&edge));
                        edge
                    }
                };
                EdgeRef::Ptr(edge)
            } else {
                EdgeRef::Gid(*gid)
            };
            from_vertex.data().write().out_edges.push(EdgeEntry {
                edge_type,
                vertex: Arc::clone(&to_vertex),
                edge: edge_ref.clone(),
            });
            to_vertex.data().write().in_edges.push(EdgeEntry {
                edge_type,
                vertex: from_vertex,
                edge: edge_ref,
            });
            *refcounts.entry(gid.as_u64()).or_insert(0) += 1;
            *edge_count += 1;
        }
        WalRecord::EdgeDelete {
            gid,
            from,
            to,
            edge_type,
        } => {
            let edge_type = mapper_edge_type(storage, edge_type);
            let from_vertex = replay_vertex(storage, *from)?;
            let to_vertex = replay_vertex(storage, *to)?;
            let edge_ref = if storage.properties_on_edges() {
                match storage.edges.get(gid) {
                    Some(entry) => EdgeRef::Ptr(Arc::clone(entry.value())),
                    None => {
                        return Err(StorageError::Corruption(format!(
                            "WAL deletes missing edge {gid}"
                        )))
                    }
                }
            } else {
                EdgeRef::Gid(*gid)
            };
            remove_edge_entry(
                &mut from_vertex.data().write().out_edges,
                edge_type,
                &to_vertex,
                &edge_ref,
            );
            remove_edge_entry(
                &mut to_vertex.data().write().in_edges,
                edge_type,
                &from_vertex,
                &edge_ref,
            );
            let count = refcounts.entry(gid.as_u64()).or_insert(1);
            *count -= 1;
            // A re-targeted edge keeps its object alive through the paired
            // creation record; only the last registration removes it.
            if *count <= 0 {
                storage.edges.remove(gid);
            }
            *edge_count -= 1;
        }
        WalRecord::EdgeSetProperty { gid, key, value } => {
            let key = mapper_property(storage, key);
            let Some(entry) = storage.edges.get(gid) else {
                return Err(StorageError::Corruption(format!(
                    "WAL sets property on missing edge {gid}"
                )));
            };
            entry.value().data().write().properties.set(key, value);
        }
        WalRecord::TransactionEnd => {}
        _ => {}
    }
    Ok(())
}
