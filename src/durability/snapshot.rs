use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::durability::encoding::{ChecksumWriter, Decoder, Encoder};
use crate::durability::{DurabilityPaths, SchemaState};
use crate::error::{Result, StorageError};
use crate::graph::edge::{Edge, EdgeRef};
use crate::graph::vertex::{EdgeEntry, Vertex};
use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::mvcc::transaction::View;
use crate::storage::{Storage, StorageAccessor};

pub(crate) const SNAPSHOT_MAGIC: &[u8; 4] = b"TNSN";
pub(crate) const SNAPSHOT_FOOTER_MAGIC: &[u8; 4] = b"TNSF";
pub(crate) const SNAPSHOT_VERSION: u64 = 1;

const SECTION_MAPPER: u8 = 0xD0;
const SECTION_INDEXES: u8 = 0xD1;
const SECTION_CONSTRAINTS: u8 = 0xD2;
const SECTION_VERTICES: u8 = 0xD3;
const SECTION_EDGES: u8 = 0xD4;
const SECTION_OFFSET_TABLE: u8 = 0xD5;

/// Trailing bytes: offset-table offset, CRC, footer magic.
const TRAILER_LEN: usize = 8 + 4 + 4;

#[derive(Debug, Clone)]
pub(crate) struct SnapshotHeader {
    pub uuid: String,
    pub epoch_id: String,
    pub last_commit_timestamp: u64,
    pub properties_on_edges: bool,
}

#[derive(Debug)]
pub(crate) struct SnapshotInfo {
    pub header: SnapshotHeader,
    pub schema: SchemaState,
    pub max_vertex_gid: Option<u64>,
    pub max_edge_gid: Option<u64>,
    pub edge_count: u64,
}

fn encode_header(header: &SnapshotHeader) -> Encoder {
    let mut enc = Encoder::new();
    enc.write_bytes(SNAPSHOT_MAGIC);
    enc.write_u64(SNAPSHOT_VERSION);
    enc.write_string(&header.uuid);
    enc.write_string(&header.epoch_id);
    enc.write_u64(header.last_commit_timestamp);
    enc.write_u8(u8::from(header.properties_on_edges));
    enc
}

fn decode_header(dec: &mut Decoder<'_>) -> Result<SnapshotHeader> {
    let magic = [
        dec.read_u8()?,
        dec.read_u8()?,
        dec.read_u8()?,
        dec.read_u8()?,
    ];
    if magic != *SNAPSHOT_MAGIC {
        return Err(StorageError::Corruption("bad snapshot magic".into()));
    }
    let version = dec.read_u64()?;
    if version != SNAPSHOT_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let uuid = dec.read_string()?;
    let epoch_id = dec.read_string()?;
    let last_commit_timestamp = dec.read_u64()?;
    let properties_on_edges = dec.read_u8()? != 0;
    Ok(SnapshotHeader {
        uuid,
        epoch_id,
        last_commit_timestamp,
        properties_on_edges,
    })
}

/// Reads just the header, without validating the body. Used to group
/// snapshot files by database lineage before paying for a full CRC pass.
pub(crate) fn read_header(path: &Path) -> Result<SnapshotHeader> {
    let mut buf = vec![0u8; 4096];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    decode_header(&mut Decoder::new(&buf[..read]))
}

fn snapshot_file_name() -> String {
    // A per-process counter keeps names unique when snapshots land inside
    // the same millisecond.
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let serial = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("{millis:017}_{serial:04}.snapshot")
}

/// Lists snapshot files newest-first by file name.
pub(crate) fn list_snapshot_files(paths: &DurabilityPaths) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(&paths.snapshots)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "snapshot") {
            files.push(path);
        }
    }
    files.sort();
    files.reverse();
    Ok(files)
}

/// Writes a self-contained snapshot of the accessor's view. The accessor
/// runs under snapshot isolation, so everything committed at or before its
/// start timestamp is included and nothing else.
pub(crate) fn create(
    storage: &Storage,
    accessor: &StorageAccessor<'_>,
    paths: &DurabilityPaths,
) -> Result<PathBuf> {
    let header = SnapshotHeader {
        uuid: storage.uuid.clone(),
        epoch_id: storage.epoch_id.clone(),
        last_commit_timestamp: accessor.transaction().start_timestamp(),
        properties_on_edges: storage.properties_on_edges(),
    };
    let path = paths.snapshots.join(snapshot_file_name());
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    let mut writer = ChecksumWriter::new(BufWriter::new(file));
    let mut offsets: Vec<(u8, u64)> = Vec::new();

    writer.write_all(encode_header(&header).as_bytes())?;

    // Name-id map.
    offsets.push((SECTION_MAPPER, writer.position()));
    let pairs = storage.name_id_mapper.pairs();
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_MAPPER);
    enc.write_u64(pairs.len() as u64);
    for (id, name) in &pairs {
        enc.write_u64(*id);
        enc.write_string(name);
    }
    writer.write_all(enc.as_bytes())?;

    // Index descriptors.
    offsets.push((SECTION_INDEXES, writer.position()));
    let label_indexes = storage.label_index.list();
    let label_property_indexes = storage.label_property_index.list();
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_INDEXES);
    enc.write_u64(label_indexes.len() as u64);
    for label in &label_indexes {
        enc.write_u64(label.as_u64());
    }
    enc.write_u64(label_property_indexes.len() as u64);
    for (label, property) in &label_property_indexes {
        enc.write_u64(label.as_u64());
        enc.write_u64(property.as_u64());
    }
    writer.write_all(enc.as_bytes())?;

    // Constraint descriptors.
    offsets.push((SECTION_CONSTRAINTS, writer.position()));
    let existence = storage.existence_constraints.list();
    let unique = storage.unique_constraints.list();
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_CONSTRAINTS);
    enc.write_u64(existence.len() as u64);
    for (label, property) in &existence {
        enc.write_u64(label.as_u64());
        enc.write_u64(property.as_u64());
    }
    enc.write_u64(unique.len() as u64);
    for (label, properties) in &unique {
        enc.write_u64(label.as_u64());
        enc.write_u32(properties.len() as u32);
        for property in properties {
            enc.write_u64(property.as_u64());
        }
    }
    writer.write_all(enc.as_bytes())?;

    // Vertices, in gid order, with adjacency stubs.
    let vertices = accessor.vertices(View::Old);
    offsets.push((SECTION_VERTICES, writer.position()));
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_VERTICES);
    enc.write_u64(vertices.len() as u64);
    writer.write_all(enc.as_bytes())?;
    let mut edges = Vec::new();
    for vertex in &vertices {
        let mut enc = Encoder::new();
        enc.write_u64(vertex.gid().as_u64());
        let labels = vertex.labels(View::Old)?;
        enc.write_u32(labels.len() as u32);
        for label in labels {
            enc.write_u64(label.as_u64());
        }
        let properties = vertex.properties(View::Old)?;
        enc.write_u32(properties.len() as u32);
        for (key, value) in &properties {
            enc.write_u64(key.as_u64());
            enc.write_value(value);
        }
        let out_edges = vertex.out_edges(View::Old)?;
        enc.write_u32(out_edges.len() as u32);
        for edge in &out_edges {
            enc.write_u64(edge.gid().as_u64());
            enc.write_u64(edge.to_vertex().gid().as_u64());
            enc.write_u64(edge.edge_type().as_u64());
        }
        if storage.properties_on_edges() {
            edges.extend(out_edges.iter().cloned());
        }
        let in_edges = vertex.in_edges(View::Old)?;
        enc.write_u32(in_edges.len() as u32);
        for edge in &in_edges {
            enc.write_u64(edge.gid().as_u64());
            enc.write_u64(edge.from_vertex().gid().as_u64());
            enc.write_u64(edge.edge_type().as_u64());
        }
        writer.write_all(enc.as_bytes())?;
    }

    // Owned edges with their properties.
    offsets.push((SECTION_EDGES, writer.position()));
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_EDGES);
    enc.write_u64(edges.len() as u64);
    writer.write_all(enc.as_bytes())?;
    for edge in &edges {
        let mut enc = Encoder::new();
        enc.write_u64(edge.gid().as_u64());
        let properties = edge.properties(View::Old)?;
        enc.write_u32(properties.len() as u32);
        for (key, value) in &properties {
            enc.write_u64(key.as_u64());
            enc.write_value(value);
        }
        writer.write_all(enc.as_bytes())?;
    }

    // Offset table and trailer.
    let offset_table_position = writer.position();
    let mut enc = Encoder::new();
    enc.write_u8(SECTION_OFFSET_TABLE);
    enc.write_u32(offsets.len() as u32);
    for (marker, offset) in &offsets {
        enc.write_u8(*marker);
        enc.write_u64(*offset);
    }
    enc.write_u64(offset_table_position);
    writer.write_all(enc.as_bytes())?;

    let checksum = writer.checksum();
    let mut enc = Encoder::new();
    enc.write_u32(checksum);
    enc.write_bytes(SNAPSHOT_FOOTER_MAGIC);
    writer.write_all(enc.as_bytes())?;

    let mut buf_writer = writer.into_inner();
    buf_writer.flush()?;
    let file = buf_writer
        .into_inner()
        .map_err(|e| StorageError::Io(e.into_error()))?;
    file.sync_all()?;
    if let Ok(dir) = File::open(&paths.snapshots) {
        let _ = dir.sync_all();
    }
    info!(
        path = %path.display(),
        vertices = vertices.len(),
        edges = edges.len(),
        last_commit_timestamp = header.last_commit_timestamp,
        "snapshot written"
    );
    Ok(path)
}

/// Verifies the trailer CRC over the full file. Cheap relative to a load
/// and run before anything is installed.
fn verify(data: &[u8]) -> Result<()> {
    if data.len() < TRAILER_LEN {
        return Err(StorageError::Corruption("snapshot truncated".into()));
    }
    let footer = &data[data.len() - 4..];
    if footer != SNAPSHOT_FOOTER_MAGIC {
        return Err(StorageError::Corruption("bad snapshot footer magic".into()));
    }
    let crc_bytes = &data[data.len() - 8..data.len() - 4];
    let expected = u32::from_be_bytes(crc_bytes.try_into().expect("length checked"));
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..data.len() - 8]);
    if hasher.finalize() != expected {
        return Err(StorageError::Corruption("snapshot checksum mismatch".into()));
    }
    Ok(())
}

struct VertexStub {
    gid: Gid,
    out_edges: Vec<(Gid, Gid, EdgeTypeId)>,
    in_edges: Vec<(Gid, Gid, EdgeTypeId)>,
}

/// Validates and installs a snapshot into an empty storage. A valid
/// snapshot alone fully reconstructs the database as of its commit
/// timestamp; the caller layers the WAL tail on top afterwards.
pub(crate) fn load(storage: &Storage, path: &Path) -> Result<SnapshotInfo> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    verify(&data)?;

    let mut dec = Decoder::new(&data);
    let header = decode_header(&mut dec)?;
    if header.properties_on_edges != storage.properties_on_edges() {
        return Err(StorageError::Corruption(format!(
            "snapshot was written with properties_on_edges={} but the storage is configured with {}",
            header.properties_on_edges,
            storage.properties_on_edges()
        )));
    }

    // Name-id map.
    if dec.read_u8()? != SECTION_MAPPER {
        return Err(StorageError::Corruption("expected mapper section".into()));
    }
    let pair_count = dec.read_u64()?;
    for _ in 0..pair_count {
        let id = dec.read_u64()?;
        let name = dec.read_string()?;
        storage.name_id_mapper.insert_pair(id, &name);
    }

    let mut schema = SchemaState::default();

    // Index descriptors.
    if dec.read_u8()? != SECTION_INDEXES {
        return Err(StorageError::Corruption("expected index section".into()));
    }
    let label_count = dec.read_u64()?;
    for _ in 0..label_count {
        schema.label_indexes.insert(dec.read_u64()?);
    }
    let pair_count = dec.read_u64()?;
    for _ in 0..pair_count {
        let label = dec.read_u64()?;
        let property = dec.read_u64()?;
        schema.label_property_indexes.insert((label, property));
    }

    // Constraint descriptors.
    if dec.read_u8()? != SECTION_CONSTRAINTS {
        return Err(StorageError::Corruption(
            "expected constraint section".into(),
        ));
    }
    let existence_count = dec.read_u64()?;
    for _ in 0..existence_count {
        let label = dec.read_u64()?;
        let property = dec.read_u64()?;
        schema.existence_constraints.insert((label, property));
    }
    let unique_count = dec.read_u64()?;
    for _ in 0..unique_count {
        let label = dec.read_u64()?;
        let property_count = dec.read_u32()? as usize;
        let mut properties = Vec::with_capacity(property_count);
        for _ in 0..property_count {
            properties.push(dec.read_u64()?);
        }
        schema.unique_constraints.insert((label, properties));
    }

    // Vertices: materialise objects first, wire adjacency second, because
    // stubs may reference vertices that appear later in gid order.
    if dec.read_u8()? != SECTION_VERTICES {
        return Err(StorageError::Corruption("expected vertex section".into()));
    }
    let vertex_count = dec.read_u64()?;
    let mut stubs = Vec::with_capacity(vertex_count.min(1 << 20) as usize);
    let mut max_vertex_gid = None;
    for _ in 0..vertex_count {
        let gid = Gid::from_u64(dec.read_u64()?);
        max_vertex_gid = max_vertex_gid.max(Some(gid.as_u64()));
        let vertex = Vertex::new(gid);
        {
            let mut data = vertex.data().write();
            let label_count = dec.read_u32()?;
            for _ in 0..label_count {
                data.labels.push(LabelId::from_u64(dec.read_u64()?));
            }
            let property_count = dec.read_u32()?;
            for _ in 0..property_count {
                let key = PropertyId::from_u64(dec.read_u64()?);
                let value = dec.read_value()?;
                data.properties.set(key, &value);
            }
        }
        let out_count = dec.read_u32()?;
        let mut out_edges = Vec::with_capacity(out_count as usize);
        for _ in 0..out_count {
            let edge = Gid::from_u64(dec.read_u64()?);
            let to = Gid::from_u64(dec.read_u64()?);
            let edge_type = EdgeTypeId::from_u64(dec.read_u64()?);
            out_edges.push((edge, to, edge_type));
        }
        let in_count = dec.read_u32()?;
        let mut in_edges = Vec::with_capacity(in_count as usize);
        for _ in 0..in_count {
            let edge = Gid::from_u64(dec.read_u64()?);
            let from = Gid::from_u64(dec.read_u64()?);
            let edge_type = EdgeTypeId::from_u64(dec.read_u64()?);
            in_edges.push((edge, from, edge_type));
        }
        storage.vertices.insert(gid, vertex);
        stubs.push(VertexStub {
            gid,
            out_edges,
            in_edges,
        });
    }

    // Owned edges.
    if dec.read_u8()? != SECTION_EDGES {
        return Err(StorageError::Corruption("expected edge section".into()));
    }
    let edge_count = dec.read_u64()?;
    let mut max_edge_gid = None;
    for _ in 0..edge_count {
        let gid = Gid::from_u64(dec.read_u64()?);
        max_edge_gid = max_edge_gid.max(Some(gid.as_u64()));
        let edge = Edge::new(gid);
        {
            let mut data = edge.data().write();
            let property_count = dec.read_u32()?;
            for _ in 0..property_count {
                let key = PropertyId::from_u64(dec.read_u64()?);
                let value = dec.read_value()?;
                data.properties.set(key, &value);
            }
        }
        storage.edges.insert(gid, edge);
    }

    let lookup_vertex = |gid: Gid| -> Result<Arc<Vertex>> {
        storage
            .vertices
            .get(&gid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                StorageError::Corruption(format!("snapshot references missing vertex {gid}"))
            })
    };
    let lookup_edge_ref = |gid: Gid| -> Result<EdgeRef> {
        if storage.properties_on_edges() {
            storage
                .edges
                .get(&gid)
                .map(|entry| EdgeRef::Ptr(Arc::clone(entry.value())))
                .ok_or_else(|| {
                    StorageError::Corruption(format!("snapshot references missing edge {gid}"))
                })
        } else {
            Ok(EdgeRef::Gid(gid))
        }
    };

    let mut adjacency_count = 0u64;
    for stub in &stubs {
        let vertex = lookup_vertex(stub.gid)?;
        let mut data = vertex.data().write();
        for (edge_gid, to, edge_type) in &stub.out_edges {
            data.out_edges.push(EdgeEntry {
                edge_type: *edge_type,
                vertex: lookup_vertex(*to)?,
                edge: lookup_edge_ref(*edge_gid)?,
            });
            max_edge_gid = max_edge_gid.max(Some(edge_gid.as_u64()));
            adjacency_count += 1;
        }
        for (edge_gid, from, edge_type) in &stub.in_edges {
            data.in_edges.push(EdgeEntry {
                edge_type: *edge_type,
                vertex: lookup_vertex(*from)?,
                edge: lookup_edge_ref(*edge_gid)?,
            });
        }
    }

    info!(
        path = %path.display(),
        vertices = stubs.len(),
        edges = adjacency_count,
        last_commit_timestamp = header.last_commit_timestamp,
        "snapshot loaded"
    );
    Ok(SnapshotInfo {
        header,
        schema,
        max_vertex_gid,
        max_edge_gid,
        edge_count: adjacency_count,
    })
}
