use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::durability::encoding::{Decoder, Encoder};
use crate::error::{Result, StorageError};
use crate::ids::Gid;
use crate::props::PropertyValue;

pub(crate) const WAL_MAGIC: &[u8; 4] = b"TNWL";
pub(crate) const WAL_VERSION: u64 = 1;

const MARKER_VERTEX_CREATE: u8 = 0x01;
const MARKER_VERTEX_DELETE: u8 = 0x02;
const MARKER_VERTEX_ADD_LABEL: u8 = 0x03;
const MARKER_VERTEX_REMOVE_LABEL: u8 = 0x04;
const MARKER_VERTEX_SET_PROPERTY: u8 = 0x05;
const MARKER_EDGE_CREATE: u8 = 0x06;
const MARKER_EDGE_DELETE: u8 = 0x07;
const MARKER_EDGE_SET_PROPERTY: u8 = 0x08;
const MARKER_TRANSACTION_END: u8 = 0x10;
const MARKER_LABEL_INDEX_CREATE: u8 = 0x20;
const MARKER_LABEL_INDEX_DROP: u8 = 0x21;
const MARKER_LABEL_PROPERTY_INDEX_CREATE: u8 = 0x22;
const MARKER_LABEL_PROPERTY_INDEX_DROP: u8 = 0x23;
const MARKER_EXISTENCE_CONSTRAINT_CREATE: u8 = 0x24;
const MARKER_EXISTENCE_CONSTRAINT_DROP: u8 = 0x25;
const MARKER_UNIQUE_CONSTRAINT_CREATE: u8 = 0x26;
const MARKER_UNIQUE_CONSTRAINT_DROP: u8 = 0x27;
const MARKER_FOOTER: u8 = 0xF0;

/// Frame overhead: marker, payload length, trailing CRC.
const FRAME_HEADER_LEN: usize = 5;
const FRAME_CRC_LEN: usize = 4;
const FOOTER_PAYLOAD_LEN: usize = 32;
const FOOTER_FRAME_LEN: u64 = (FRAME_HEADER_LEN + FOOTER_PAYLOAD_LEN + FRAME_CRC_LEN) as u64;

/// One forward operation in the log. Label, edge-type and property-key
/// names are spelled out so a WAL tail stays self-describing when replayed
/// on top of a snapshot with a different interning state.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    VertexCreate {
        gid: Gid,
    },
    VertexDelete {
        gid: Gid,
    },
    VertexAddLabel {
        gid: Gid,
        label: String,
    },
    VertexRemoveLabel {
        gid: Gid,
        label: String,
    },
    VertexSetProperty {
        gid: Gid,
        key: String,
        value: PropertyValue,
    },
    EdgeCreate {
        gid: Gid,
        from: Gid,
        to: Gid,
        edge_type: String,
    },
    EdgeDelete {
        gid: Gid,
        from: Gid,
        to: Gid,
        edge_type: String,
    },
    EdgeSetProperty {
        gid: Gid,
        key: String,
        value: PropertyValue,
    },
    TransactionEnd,
    LabelIndexCreate {
        label: String,
    },
    LabelIndexDrop {
        label: String,
    },
    LabelPropertyIndexCreate {
        label: String,
        property: String,
    },
    LabelPropertyIndexDrop {
        label: String,
        property: String,
    },
    ExistenceConstraintCreate {
        label: String,
        property: String,
    },
    ExistenceConstraintDrop {
        label: String,
        property: String,
    },
    UniqueConstraintCreate {
        label: String,
        properties: Vec<String>,
    },
    UniqueConstraintDrop {
        label: String,
        properties: Vec<String>,
    },
}

impl WalRecord {
    fn marker(&self) -> u8 {
        match self {
            WalRecord::VertexCreate { .. } => MARKER_VERTEX_CREATE,
            WalRecord::VertexDelete { .. } => MARKER_VERTEX_DELETE,
            WalRecord::VertexAddLabel { .. } => MARKER_VERTEX_ADD_LABEL,
            WalRecord::VertexRemoveLabel { .. } => MARKER_VERTEX_REMOVE_LABEL,
            WalRecord::VertexSetProperty { .. } => MARKER_VERTEX_SET_PROPERTY,
            WalRecord::EdgeCreate { .. } => MARKER_EDGE_CREATE,
            WalRecord::EdgeDelete { .. } => MARKER_EDGE_DELETE,
            WalRecord::EdgeSetProperty { .. } => MARKER_EDGE_SET_PROPERTY,
            WalRecord::TransactionEnd => MARKER_TRANSACTION_END,
            WalRecord::LabelIndexCreate { .. } => MARKER_LABEL_INDEX_CREATE,
            WalRecord::LabelIndexDrop { .. } => MARKER_LABEL_INDEX_DROP,
            WalRecord::LabelPropertyIndexCreate { .. } => MARKER_LABEL_PROPERTY_INDEX_CREATE,
            WalRecord::LabelPropertyIndexDrop { .. } => MARKER_LABEL_PROPERTY_INDEX_DROP,
            WalRecord::ExistenceConstraintCreate { .. } => MARKER_EXISTENCE_CONSTRAINT_CREATE,
            WalRecord::ExistenceConstraintDrop { .. } => MARKER_EXISTENCE_CONSTRAINT_DROP,
            WalRecord::UniqueConstraintCreate { .. } => MARKER_UNIQUE_CONSTRAINT_CREATE,
            WalRecord::UniqueConstraintDrop { .. } => MARKER_UNIQUE_CONSTRAINT_DROP,
        }
    }

    /// Whether the record describes a schema operation rather than data.
    pub fn is_schema(&self) -> bool {
        matches!(
            self,
            WalRecord::LabelIndexCreate { .. }
                | WalRecord::LabelIndexDrop { .. }
                | WalRecord::LabelPropertyIndexCreate { .. }
                | WalRecord::LabelPropertyIndexDrop { .. }
                | WalRecord::ExistenceConstraintCreate { .. }
                | WalRecord::ExistenceConstraintDrop { .. }
                | WalRecord::UniqueConstraintCreate { .. }
                | WalRecord::UniqueConstraintDrop { .. }
        )
    }

    fn encode_payload(&self, enc: &mut Encoder, commit_timestamp: u64) {
        enc.write_u64(commit_timestamp);
        match self {
            WalRecord::VertexCreate { gid } | WalRecord::VertexDelete { gid } => {
                enc.write_u64(gid.as_u64());
            }
            WalRecord::VertexAddLabel { gid, label }
            | WalRecord::VertexRemoveLabel { gid, label } => {
                enc.write_u64(gid.as_u64());
                enc.write_string(label);
            }
            WalRecord::VertexSetProperty { gid, key, value }
            | WalRecord::EdgeSetProperty { gid, key, value } => {
                enc.write_u64(gid.as_u64());
                enc.write_string(key);
                enc.write_value(value);
            }
            WalRecord::EdgeCreate {
                gid,
                from,
                to,
                edge_type,
            }
            | WalRecord::EdgeDelete {
                gid,
                from,
                to,
                edge_type,
            } => {
                enc.write_u64(gid.as_u64());
                enc.write_u64(from.as_u64());
                enc.write_u64(to.as_u64());
                enc.write_string(edge_type);
            }
            WalRecord::TransactionEnd => {}
            WalRecord::LabelIndexCreate { label } | WalRecord::LabelIndexDrop { label } => {
                enc.write_string(label);
            }
            WalRecord::LabelPropertyIndexCreate { label, property }
            | WalRecord::LabelPropertyIndexDrop { label, property }
            | WalRecord::ExistenceConstraintCreate { label, property }
            | WalRecord::ExistenceConstraintDrop { label, property } => {
                enc.write_string(label);
                enc.write_string(property);
            }
            WalRecord::UniqueConstraintCreate { label, properties }
            | WalRecord::UniqueConstraintDrop { label, properties } => {
                enc.write_string(label);
                enc.write_u32(properties.len() as u32);
                for property in properties {
                    enc.write_string(property);
                }
            }
        }
    }

    fn decode_payload(marker: u8, dec: &mut Decoder<'_>) -> Result<(u64, WalRecord)> {
        let commit_timestamp = dec.read_u64()?;
        let record = match marker {
            MARKER_VERTEX_CREATE => WalRecord::VertexCreate {
                gid: Gid::from_u64(dec.read_u64()?),
            },
            MARKER_VERTEX_DELETE => WalRecord::VertexDelete {
                gid: Gid::from_u64(dec.read_u64()?),
            },
            MARKER_VERTEX_ADD_LABEL => WalRecord::VertexAddLabel {
                gid: Gid::from_u64(dec.read_u64()?),
                label: dec.read_string()?,
            },
            MARKER_VERTEX_REMOVE_LABEL => WalRecord::VertexRemoveLabel {
                gid: Gid::from_u64(dec.read_u64()?),
                label: dec.read_string()?,
            },
            MARKER_VERTEX_SET_PROPERTY => WalRecord::VertexSetProperty {
                gid: Gid::from_u64(dec.read_u64()?),
                key: dec.read_string()?,
                value: dec.read_value()?,
            },
            MARKER_EDGE_CREATE => WalRecord::EdgeCreate {
                gid: Gid::from_u64(dec.read_u64()?),
                from: Gid::from_u64(dec.read_u64()?),
                to: Gid::from_u64(dec.read_u64()?),
                edge_type: dec.read_string()?,
            },
            MARKER_EDGE_DELETE => WalRecord::EdgeDelete {
                gid: Gid::from_u64(dec.read_u64()?),
                from: Gid::from_u64(dec.read_u64()?),
                to: Gid::from_u64(dec.read_u64()?),
                edge_type: dec.read_string()?,
            },
            MARKER_EDGE_SET_PROPERTY => WalRecord::EdgeSetProperty {
                gid: Gid::from_u64(dec.read_u64()?),
                key: dec.read_string()?,
                value: dec.read_value()?,
            },
            MARKER_TRANSACTION_END => WalRecord::TransactionEnd,
            MARKER_LABEL_INDEX_CREATE => WalRecord::LabelIndexCreate {
                label: dec.read_string()?,
            },
            MARKER_LABEL_INDEX_DROP => WalRecord::LabelIndexDrop {
                label: dec.read_string()?,
            },
            MARKER_LABEL_PROPERTY_INDEX_CREATE => WalRecord::LabelPropertyIndexCreate {
                label: dec.read_string()?,
                property: dec.read_string()?,
            },
            MARKER_LABEL_PROPERTY_INDEX_DROP => WalRecord::LabelPropertyIndexDrop {
                label: dec.read_string()?,
                property: dec.read_string()?,
            },
            MARKER_EXISTENCE_CONSTRAINT_CREATE => WalRecord::ExistenceConstraintCreate {
                label: dec.read_string()?,
                property: dec.read_string()?,
            },
            MARKER_EXISTENCE_CONSTRAINT_DROP => WalRecord::ExistenceConstraintDrop {
                label: dec.read_string()?,
                property: dec.read_string()?,
            },
            MARKER_UNIQUE_CONSTRAINT_CREATE => {
                let label = dec.read_string()?;
                let count = dec.read_u32()? as usize;
                let mut properties = Vec::with_capacity(count);
                for _ in 0..count {
                    properties.push(dec.read_string()?);
                }
                WalRecord::UniqueConstraintCreate { label, properties }
            }
            MARKER_UNIQUE_CONSTRAINT_DROP => {
                let label = dec.read_string()?;
                let count = dec.read_u32()? as usize;
                let mut properties = Vec::with_capacity(count);
                for _ in 0..count {
                    properties.push(dec.read_string()?);
                }
                WalRecord::UniqueConstraintDrop { label, properties }
            }
            _ => return Err(StorageError::Corruption("unknown WAL record marker".into())),
        };
        Ok((commit_timestamp, record))
    }
}

fn encode_frame(marker: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len() + FRAME_CRC_LEN);
    frame.push(marker);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame);
    frame.extend_from_slice(&hasher.finalize().to_be_bytes());
    frame
}

pub fn wal_file_name(sequence: u64) -> String {
    format!("{sequence:020}.wal")
}

/// Appends framed records to the active WAL file, rotating by size and
/// syncing per the flush policy. Only the thread holding the commit
/// serialisation lock writes here, so records land in commit order.
#[derive(Debug)]
pub(crate) struct WalWriter {
    directory: PathBuf,
    uuid: String,
    epoch_id: String,
    file: File,
    sequence: u64,
    first_timestamp: Option<u64>,
    last_timestamp: u64,
    num_deltas: u64,
    offset_deltas: u64,
    bytes_written: u64,
    size_limit_bytes: u64,
    flush_every_n_tx: u64,
    txs_since_flush: u64,
    finalized: bool,
}

impl WalWriter {
    pub(crate) fn open(
        directory: &Path,
        uuid: &str,
        epoch_id: &str,
        sequence: u64,
        size_limit_kibibytes: u64,
        flush_every_n_tx: u64,
    ) -> Result<Self> {
        let path = directory.join(wal_file_name(sequence));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = Encoder::new();
        header.write_bytes(WAL_MAGIC);
        header.write_u64(WAL_VERSION);
        header.write_u64(sequence);
        header.write_string(uuid);
        header.write_string(epoch_id);
        let offset_deltas = header.len() as u64;
        file.write_all(header.as_bytes())?;

        Ok(Self {
            directory: directory.to_path_buf(),
            uuid: uuid.to_owned(),
            epoch_id: epoch_id.to_owned(),
            file,
            sequence,
            first_timestamp: None,
            last_timestamp: 0,
            num_deltas: 0,
            offset_deltas,
            bytes_written: offset_deltas,
            size_limit_bytes: size_limit_kibibytes * 1024,
            flush_every_n_tx: flush_every_n_tx.max(1),
            txs_since_flush: 0,
            finalized: false,
        })
    }

    fn write_record(&mut self, record: &WalRecord, commit_timestamp: u64) -> Result<()> {
        let mut payload = Encoder::new();
        record.encode_payload(&mut payload, commit_timestamp);
        let frame = encode_frame(record.marker(), payload.as_bytes());
        self.file.write_all(&frame)?;
        self.bytes_written += frame.len() as u64;
        self.first_timestamp.get_or_insert(commit_timestamp);
        self.last_timestamp = commit_timestamp;
        self.num_deltas += 1;
        Ok(())
    }

    /// Appends one transaction's records followed by its end marker, then
    /// applies the rotation and flush policies.
    pub(crate) fn append_transaction(
        &mut self,
        records: &[WalRecord],
        commit_timestamp: u64,
    ) -> Result<()> {
        for record in records {
            self.write_record(record, commit_timestamp)?;
        }
        self.write_record(&WalRecord::TransactionEnd, commit_timestamp)?;
        self.txs_since_flush += 1;
        if self.bytes_written >= self.size_limit_bytes {
            self.rotate()?;
        } else if self.txs_since_flush >= self.flush_every_n_tx {
            self.sync()?;
        }
        Ok(())
    }

    /// Schema operations are their own transactions in the log and are
    /// always made durable immediately.
    pub(crate) fn append_schema(&mut self, record: &WalRecord, commit_timestamp: u64) -> Result<()> {
        self.write_record(record, commit_timestamp)?;
        self.sync()?;
        if self.bytes_written >= self.size_limit_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        self.txs_since_flush = 0;
        Ok(())
    }

    /// Appends the footer and syncs. A file without a footer is a crash
    /// tail; the reader scans it record by record instead.
    pub(crate) fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        let mut payload = Encoder::new();
        payload.write_u64(self.first_timestamp.unwrap_or(0));
        payload.write_u64(self.last_timestamp);
        payload.write_u64(self.num_deltas);
        payload.write_u64(self.offset_deltas);
        let frame = encode_frame(MARKER_FOOTER, payload.as_bytes());
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.finalized = true;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.finalize()?;
        let next = WalWriter::open(
            &self.directory,
            &self.uuid,
            &self.epoch_id,
            self.sequence + 1,
            self.size_limit_bytes / 1024,
            self.flush_every_n_tx,
        )?;
        *self = next;
        Ok(())
    }
}

/// Summary of one WAL file, cheap to obtain for finalized files.
#[derive(Debug, Clone)]
pub struct WalInfo {
    pub path: PathBuf,
    pub sequence: u64,
    pub uuid: String,
    #[allow(dead_code)]
    pub epoch_id: String,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub num_deltas: u64,
    #[allow(dead_code)]
    pub offset_deltas: u64,
    pub finalized: bool,
}

#[derive(Debug, Clone)]
pub struct WalEntry {
    pub commit_timestamp: u64,
    pub record: WalRecord,
}

struct WalHeader {
    sequence: u64,
    uuid: String,
    epoch_id: String,
    offset_deltas: u64,
}

fn parse_header(data: &[u8]) -> Result<WalHeader> {
    let mut dec = Decoder::new(data);
    let magic = [
        dec.read_u8()?,
        dec.read_u8()?,
        dec.read_u8()?,
        dec.read_u8()?,
    ];
    if magic != *WAL_MAGIC {
        return Err(StorageError::Corruption("bad WAL magic".into()));
    }
    let version = dec.read_u64()?;
    if version != WAL_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported WAL version {version}"
        )));
    }
    let sequence = dec.read_u64()?;
    let uuid = dec.read_string()?;
    let epoch_id = dec.read_string()?;
    Ok(WalHeader {
        sequence,
        uuid,
        epoch_id,
        offset_deltas: dec.position() as u64,
    })
}

/// Parses one frame at `pos`. Returns `None` on clean end of data, an error
/// on a torn or corrupt frame.
fn parse_frame(data: &[u8], pos: &mut usize) -> Result<Option<(u8, Vec<u8>)>> {
    if *pos == data.len() {
        return Ok(None);
    }
    let header_end = *pos + FRAME_HEADER_LEN;
    let Some(header) = data.get(*pos..header_end) else {
        return Err(StorageError::Corruption("torn WAL frame header".into()));
    };
    let marker = header[0];
    let len = u32::from_be_bytes(header[1..5].try_into().expect("length checked")) as usize;
    let payload_end = header_end + len;
    let crc_end = payload_end + FRAME_CRC_LEN;
    let Some(frame) = data.get(*pos..crc_end) else {
        return Err(StorageError::Corruption("torn WAL frame".into()));
    };
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&frame[..FRAME_HEADER_LEN + len]);
    let expected = u32::from_be_bytes(frame[FRAME_HEADER_LEN + len..].try_into().expect("length checked"));
    if hasher.finalize() != expected {
        return Err(StorageError::Corruption("WAL frame checksum mismatch".into()));
    }
    let payload = frame[FRAME_HEADER_LEN..FRAME_HEADER_LEN + len].to_vec();
    *pos = crc_end;
    Ok(Some((marker, payload)))
}

/// Reads a file's summary triple. Finalized files answer from the footer;
/// crash tails are scanned.
pub fn read_info(path: &Path) -> Result<WalInfo> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let header = parse_header(&data)?;

    // Fast path: a valid footer frame sits at the very end.
    if data.len() as u64 >= header.offset_deltas + FOOTER_FRAME_LEN {
        let footer_start = data.len() - FOOTER_FRAME_LEN as usize;
        let mut pos = footer_start;
        if let Ok(Some((marker, payload))) = parse_frame(&data, &mut pos) {
            if marker == MARKER_FOOTER && payload.len() == FOOTER_PAYLOAD_LEN {
                let mut dec = Decoder::new(&payload);
                let first = dec.read_u64()?;
                let last = dec.read_u64()?;
                let num_deltas = dec.read_u64()?;
                let offset_deltas = dec.read_u64()?;
                return Ok(WalInfo {
                    path: path.to_path_buf(),
                    sequence: header.sequence,
                    uuid: header.uuid,
                    epoch_id: header.epoch_id,
                    first_timestamp: (num_deltas > 0).then_some(first),
                    last_timestamp: (num_deltas > 0).then_some(last),
                    num_deltas,
                    offset_deltas,
                    finalized: true,
                });
            }
        }
    }

    let (entries, _) = scan_records(&data, header.offset_deltas as usize)?;
    Ok(WalInfo {
        path: path.to_path_buf(),
        sequence: header.sequence,
        uuid: header.uuid,
        epoch_id: header.epoch_id,
        first_timestamp: entries.first().map(|e| e.commit_timestamp),
        last_timestamp: entries.last().map(|e| e.commit_timestamp),
        num_deltas: entries.len() as u64,
        offset_deltas: header.offset_deltas,
        finalized: false,
    })
}

fn scan_records(data: &[u8], start: usize) -> Result<(Vec<WalEntry>, bool)> {
    let mut entries = Vec::new();
    let mut pos = start;
    loop {
        match parse_frame(data, &mut pos) {
            Ok(None) => return Ok((entries, true)),
            Ok(Some((MARKER_FOOTER, _))) => return Ok((entries, true)),
            Ok(Some((marker, payload))) => {
                let mut dec = Decoder::new(&payload);
                let (commit_timestamp, record) = WalRecord::decode_payload(marker, &mut dec)?;
                entries.push(WalEntry {
                    commit_timestamp,
                    record,
                });
            }
            // A torn tail ends the scan; the caller decides whether a dirty
            // end is tolerable for this file.
            Err(_) => return Ok((entries, false)),
        }
    }
}

/// Reads every decodable record. The boolean reports a clean end: `false`
/// means the file ends in a torn or corrupt frame.
pub fn read_records(path: &Path) -> Result<(Vec<WalEntry>, bool)> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let header = parse_header(&data)?;
    scan_records(&data, header.offset_deltas as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<WalRecord> {
        vec![
            WalRecord::VertexCreate {
                gid: Gid::from_u64(1),
            },
            WalRecord::VertexAddLabel {
                gid: Gid::from_u64(1),
                label: "Person".into(),
            },
            WalRecord::VertexSetProperty {
                gid: Gid::from_u64(1),
                key: "name".into(),
                value: PropertyValue::String("mira".into()),
            },
        ]
    }

    #[test]
    fn write_and_read_back() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), "uuid-1", "epoch-1", 0, 1024, 1).unwrap();
        writer.append_transaction(&sample_records(), 7).unwrap();
        writer.finalize().unwrap();

        let path = dir.path().join(wal_file_name(0));
        let info = read_info(&path).unwrap();
        assert!(info.finalized);
        assert_eq!(info.sequence, 0);
        assert_eq!(info.uuid, "uuid-1");
        assert_eq!(info.first_timestamp, Some(7));
        assert_eq!(info.last_timestamp, Some(7));
        assert_eq!(info.num_deltas, 4);

        let (entries, clean) = read_records(&path).unwrap();
        assert!(clean);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].record, sample_records()[0]);
        assert_eq!(entries[3].record, WalRecord::TransactionEnd);
    }

    #[test]
    fn unfinalized_file_is_scanned() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), "uuid-1", "epoch-1", 3, 1024, 1).unwrap();
        writer.append_transaction(&sample_records(), 11).unwrap();
        drop(writer);

        let path = dir.path().join(wal_file_name(3));
        let info = read_info(&path).unwrap();
        assert!(!info.finalized);
        assert_eq!(info.first_timestamp, Some(11));
        assert_eq!(info.num_deltas, 4);
    }

    #[test]
    fn torn_tail_reports_dirty_end() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path(), "uuid-1", "epoch-1", 0, 1024, 1).unwrap();
        writer.append_transaction(&sample_records(), 5).unwrap();
        writer.append_transaction(&sample_records(), 6).unwrap();
        drop(writer);

        let path = dir.path().join(wal_file_name(0));
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 3]).unwrap();

        let (entries, clean) = read_records(&path).unwrap();
        assert!(!clean);
        // The torn frame belongs to the second transaction.
        assert!(entries.iter().any(|e| e.commit_timestamp == 5));
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.record == WalRecord::TransactionEnd)
                .count(),
            1
        );
    }

    #[test]
    fn rotation_starts_a_new_sequence() {
        let dir = tempdir().unwrap();
        // 1 KiB limit forces a rotation almost immediately.
        let mut writer = WalWriter::open(dir.path(), "uuid-1", "epoch-1", 0, 1, 100).unwrap();
        for ts in 0..40 {
            writer.append_transaction(&sample_records(), ts).unwrap();
        }
        writer.finalize().unwrap();

        let first = read_info(&dir.path().join(wal_file_name(0))).unwrap();
        assert!(first.finalized);
        assert!(dir.path().join(wal_file_name(1)).exists());
    }
}
