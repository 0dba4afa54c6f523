use std::cmp::Ordering;
use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::{Result, StorageError};
use crate::ids::PropertyId;

/// Temporal value class carried by [`PropertyValue::Temporal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemporalType {
    Date,
    LocalTime,
    LocalDateTime,
    Duration,
}

/// Microsecond-resolution temporal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TemporalData {
    pub temporal_type: TemporalType,
    pub microseconds: i64,
}

#[derive(Debug, Clone)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
    Temporal(TemporalData),
}

impl PropertyValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            PropertyValue::Null => 0,
            PropertyValue::Bool(_) => 1,
            PropertyValue::Int(_) | PropertyValue::Float(_) => 2,
            PropertyValue::String(_) => 3,
            PropertyValue::List(_) => 4,
            PropertyValue::Map(_) => 5,
            PropertyValue::Temporal(_) => 6,
        }
    }
}

/// Total order used by the label-property index and the unique-constraint
/// sets. Integers and floats compare numerically so range scans interleave
/// them; on a numeric tie the integer sorts first, which keeps the order
/// consistent with equality.
impl Ord for PropertyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use PropertyValue::*;
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b).then(Ordering::Less),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)).then(Ordering::Greater),
            (String(a), String(b)) => a.cmp(b),
            (List(a), List(b)) => a.cmp(b),
            (Map(a), Map(b)) => a.iter().cmp(b.iter()),
            (Temporal(a), Temporal(b)) => a.cmp(b),
            _ => unreachable!("type ranks matched"),
        }
    }
}

impl PartialOrd for PropertyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PropertyValue {}

impl std::hash::Hash for PropertyValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        use PropertyValue::*;
        self.type_rank().hash(state);
        match self {
            Null => {}
            Bool(b) => b.hash(state),
            Int(i) => i.hash(state),
            Float(f) => f.to_bits().hash(state),
            String(s) => s.hash(state),
            List(items) => items.hash(state),
            Map(map) => {
                for (k, v) in map.iter() {
                    k.hash(state);
                    v.hash(state);
                }
            }
            Temporal(t) => t.hash(state),
        }
    }
}

const TAG_NULL: u8 = 0x00;
const TAG_BOOL_FALSE: u8 = 0x01;
const TAG_BOOL_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STRING: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_TEMPORAL: u8 = 0x08;

fn write_uint(buf: &mut impl Extend<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.extend([byte]);
            return;
        }
        buf.extend([byte | 0x80]);
    }
}

fn read_uint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data
            .get(*pos)
            .ok_or(StorageError::Corruption("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(StorageError::Corruption("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

fn temporal_type_tag(t: TemporalType) -> u8 {
    match t {
        TemporalType::Date => 0,
        TemporalType::LocalTime => 1,
        TemporalType::LocalDateTime => 2,
        TemporalType::Duration => 3,
    }
}

fn temporal_type_from_tag(tag: u8) -> Result<TemporalType> {
    match tag {
        0 => Ok(TemporalType::Date),
        1 => Ok(TemporalType::LocalTime),
        2 => Ok(TemporalType::LocalDateTime),
        3 => Ok(TemporalType::Duration),
        _ => Err(StorageError::Corruption("unknown temporal type tag".into())),
    }
}

pub(crate) fn encode_value(buf: &mut Vec<u8>, value: &PropertyValue) {
    match value {
        PropertyValue::Null => buf.push(TAG_NULL),
        PropertyValue::Bool(false) => buf.push(TAG_BOOL_FALSE),
        PropertyValue::Bool(true) => buf.push(TAG_BOOL_TRUE),
        PropertyValue::Int(v) => {
            buf.push(TAG_INT);
            write_uint(buf, zigzag(*v));
        }
        PropertyValue::Float(v) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        PropertyValue::String(v) => {
            buf.push(TAG_STRING);
            write_uint(buf, v.len() as u64);
            buf.extend_from_slice(v.as_bytes());
        }
        PropertyValue::List(items) => {
            buf.push(TAG_LIST);
            write_uint(buf, items.len() as u64);
            for item in items {
                encode_value(buf, item);
            }
        }
        PropertyValue::Map(entries) => {
            buf.push(TAG_MAP);
            write_uint(buf, entries.len() as u64);
            for (key, item) in entries {
                write_uint(buf, key.len() as u64);
                buf.extend_from_slice(key.as_bytes());
                encode_value(buf, item);
            }
        }
        PropertyValue::Temporal(t) => {
            buf.push(TAG_TEMPORAL);
            buf.push(temporal_type_tag(t.temporal_type));
            write_uint(buf, zigzag(t.microseconds));
        }
    }
}

pub(crate) fn decode_value(data: &[u8], pos: &mut usize) -> Result<PropertyValue> {
    let tag = *data
        .get(*pos)
        .ok_or(StorageError::Corruption("truncated property value".into()))?;
    *pos += 1;
    match tag {
        TAG_NULL => Ok(PropertyValue::Null),
        TAG_BOOL_FALSE => Ok(PropertyValue::Bool(false)),
        TAG_BOOL_TRUE => Ok(PropertyValue::Bool(true)),
        TAG_INT => Ok(PropertyValue::Int(unzigzag(read_uint(data, pos)?))),
        TAG_FLOAT => {
            let end = *pos + 8;
            let bytes = data
                .get(*pos..end)
                .ok_or(StorageError::Corruption("truncated float".into()))?;
            *pos = end;
            Ok(PropertyValue::Float(f64::from_bits(u64::from_be_bytes(
                bytes.try_into().expect("slice length checked"),
            ))))
        }
        TAG_STRING => {
            let len = read_uint(data, pos)? as usize;
            let end = *pos + len;
            let bytes = data
                .get(*pos..end)
                .ok_or(StorageError::Corruption("truncated string".into()))?;
            *pos = end;
            let text = std::str::from_utf8(bytes)
                .map_err(|_| StorageError::Corruption("invalid utf-8 in property".into()))?;
            Ok(PropertyValue::String(text.to_owned()))
        }
        TAG_LIST => {
            let count = read_uint(data, pos)? as usize;
            let mut items = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                items.push(decode_value(data, pos)?);
            }
            Ok(PropertyValue::List(items))
        }
        TAG_MAP => {
            let count = read_uint(data, pos)? as usize;
            let mut entries = BTreeMap::new();
            for _ in 0..count {
                let len = read_uint(data, pos)? as usize;
                let end = *pos + len;
                let bytes = data
                    .get(*pos..end)
                    .ok_or(StorageError::Corruption("truncated map key".into()))?;
                *pos = end;
                let key = std::str::from_utf8(bytes)
                    .map_err(|_| StorageError::Corruption("invalid utf-8 in map key".into()))?
                    .to_owned();
                entries.insert(key, decode_value(data, pos)?);
            }
            Ok(PropertyValue::Map(entries))
        }
        TAG_TEMPORAL => {
            let type_tag = *data
                .get(*pos)
                .ok_or(StorageError::Corruption("truncated temporal".into()))?;
            *pos += 1;
            Ok(PropertyValue::Temporal(TemporalData {
                temporal_type: temporal_type_from_tag(type_tag)?,
                microseconds: unzigzag(read_uint(data, pos)?),
            }))
        }
        _ => Err(StorageError::Corruption("unknown property tag".into())),
    }
}

fn skip_value(data: &[u8], pos: &mut usize) -> Result<()> {
    let tag = *data
        .get(*pos)
        .ok_or(StorageError::Corruption("truncated property value".into()))?;
    *pos += 1;
    match tag {
        TAG_NULL | TAG_BOOL_FALSE | TAG_BOOL_TRUE => Ok(()),
        TAG_INT => read_uint(data, pos).map(|_| ()),
        TAG_FLOAT => {
            *pos += 8;
            if *pos > data.len() {
                return Err(StorageError::Corruption("truncated float".into()));
            }
            Ok(())
        }
        TAG_STRING => {
            let len = read_uint(data, pos)? as usize;
            *pos += len;
            if *pos > data.len() {
                return Err(StorageError::Corruption("truncated string".into()));
            }
            Ok(())
        }
        TAG_LIST => {
            let count = read_uint(data, pos)?;
            for _ in 0..count {
                skip_value(data, pos)?;
            }
            Ok(())
        }
        TAG_MAP => {
            let count = read_uint(data, pos)?;
            for _ in 0..count {
                let len = read_uint(data, pos)? as usize;
                *pos += len;
                if *pos > data.len() {
                    return Err(StorageError::Corruption("truncated map key".into()));
                }
                skip_value(data, pos)?;
            }
            Ok(())
        }
        TAG_TEMPORAL => {
            *pos += 1;
            read_uint(data, pos).map(|_| ())
        }
        _ => Err(StorageError::Corruption("unknown property tag".into())),
    }
}

/// Compact `{key -> value}` map encoded as a flat byte buffer.
///
/// Entries are `varint key id` followed by a tagged value. The buffer stays
/// inline for small maps. Setting a key to [`PropertyValue::Null`] removes
/// it, and a single `(key, value)` pair can be probed for equality against
/// the encoded bytes without decoding the stored values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyStore {
    buffer: SmallVec<[u8; 36]>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Byte range of the entry for `key`, if present. The buffer is written
    /// only by this module, so decode failures inside it are bugs.
    fn find(&self, key: PropertyId) -> Option<(usize, usize)> {
        let data = &self.buffer[..];
        let mut pos = 0;
        while pos < data.len() {
            let start = pos;
            let entry_key = read_uint(data, &mut pos).expect("store buffer well formed");
            skip_value(data, &mut pos).expect("store buffer well formed");
            if entry_key == key.as_u64() {
                return Some((start, pos));
            }
        }
        None
    }

    pub fn get(&self, key: PropertyId) -> PropertyValue {
        match self.find(key) {
            Some((start, _)) => {
                let mut pos = start;
                read_uint(&self.buffer, &mut pos).expect("store buffer well formed");
                decode_value(&self.buffer, &mut pos).expect("store buffer well formed")
            }
            None => PropertyValue::Null,
        }
    }

    pub fn has(&self, key: PropertyId) -> bool {
        self.find(key).is_some()
    }

    /// Compares the stored value for `key` against `value` by encoded bytes.
    /// Probing for `Null` asks "is the key absent".
    pub fn is_property_equal(&self, key: PropertyId, value: &PropertyValue) -> bool {
        match self.find(key) {
            Some((start, end)) => {
                let mut pos = start;
                read_uint(&self.buffer, &mut pos).expect("store buffer well formed");
                let mut probe = Vec::new();
                encode_value(&mut probe, value);
                self.buffer[pos..end] == probe[..]
            }
            None => value.is_null(),
        }
    }

    /// Sets `key` to `value` and returns the previous value. A `Null` value
    /// removes the key.
    pub fn set(&mut self, key: PropertyId, value: &PropertyValue) -> PropertyValue {
        let old = match self.find(key) {
            Some((start, end)) => {
                let mut pos = start;
                read_uint(&self.buffer, &mut pos).expect("store buffer well formed");
                let old = decode_value(&self.buffer, &mut pos).expect("store buffer well formed");
                self.buffer.drain(start..end);
                old
            }
            None => PropertyValue::Null,
        };
        if !value.is_null() {
            let mut entry = Vec::new();
            write_uint(&mut entry, key.as_u64());
            encode_value(&mut entry, value);
            self.buffer.extend_from_slice(&entry);
        }
        old
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// All `(key, value)` pairs in storage order.
    pub fn properties(&self) -> Vec<(PropertyId, PropertyValue)> {
        let data = &self.buffer[..];
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let key = read_uint(data, &mut pos).expect("store buffer well formed");
            let value = decode_value(data, &mut pos).expect("store buffer well formed");
            out.push((PropertyId::from_u64(key), value));
        }
        out
    }

    /// Values for `keys`, in order, or `None` unless every key is present.
    pub fn extract_property_values(&self, keys: &[PropertyId]) -> Option<Vec<PropertyValue>> {
        let mut values = Vec::with_capacity(keys.len());
        for &key in keys {
            match self.find(key) {
                Some((start, _)) => {
                    let mut pos = start;
                    read_uint(&self.buffer, &mut pos).expect("store buffer well formed");
                    values
                        .push(decode_value(&self.buffer, &mut pos).expect("store buffer well formed"));
                }
                None => return None,
            }
        }
        Some(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: u64) -> PropertyId {
        PropertyId::from_u64(raw)
    }

    #[test]
    fn set_get_remove() {
        let mut store = PropertyStore::new();
        assert!(store.get(key(1)).is_null());
        let old = store.set(key(1), &PropertyValue::Int(42));
        assert!(old.is_null());
        assert_eq!(store.get(key(1)), PropertyValue::Int(42));

        let old = store.set(key(1), &PropertyValue::String("x".into()));
        assert_eq!(old, PropertyValue::Int(42));

        let old = store.set(key(1), &PropertyValue::Null);
        assert_eq!(old, PropertyValue::String("x".into()));
        assert!(store.is_empty());
    }

    #[test]
    fn equality_probe_without_decode() {
        let mut store = PropertyStore::new();
        store.set(key(3), &PropertyValue::String("graph".into()));
        store.set(key(5), &PropertyValue::Float(2.5));
        assert!(store.is_property_equal(key(3), &PropertyValue::String("graph".into())));
        assert!(!store.is_property_equal(key(3), &PropertyValue::String("grape".into())));
        assert!(store.is_property_equal(key(5), &PropertyValue::Float(2.5)));
        // Absent key equals null.
        assert!(store.is_property_equal(key(9), &PropertyValue::Null));
        assert!(!store.is_property_equal(key(3), &PropertyValue::Null));
    }

    #[test]
    fn nested_values_round_trip() {
        let mut store = PropertyStore::new();
        let mut map = BTreeMap::new();
        map.insert("a".to_owned(), PropertyValue::Bool(true));
        map.insert(
            "b".to_owned(),
            PropertyValue::List(vec![PropertyValue::Int(-7), PropertyValue::Null]),
        );
        let value = PropertyValue::Map(map);
        store.set(key(2), &value);
        store.set(
            key(4),
            &PropertyValue::Temporal(TemporalData {
                temporal_type: TemporalType::Duration,
                microseconds: -1_000_000,
            }),
        );
        assert_eq!(store.get(key(2)), value);
        assert_eq!(store.properties().len(), 2);
    }

    #[test]
    fn extract_requires_all_keys() {
        let mut store = PropertyStore::new();
        store.set(key(1), &PropertyValue::Int(1));
        store.set(key(2), &PropertyValue::Int(2));
        assert_eq!(
            store.extract_property_values(&[key(2), key(1)]),
            Some(vec![PropertyValue::Int(2), PropertyValue::Int(1)])
        );
        assert_eq!(store.extract_property_values(&[key(1), key(3)]), None);
    }

    #[test]
    fn value_order_interleaves_numbers() {
        let mut values = vec![
            PropertyValue::Float(1.5),
            PropertyValue::Int(2),
            PropertyValue::Int(1),
            PropertyValue::String("a".into()),
            PropertyValue::Bool(true),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                PropertyValue::Bool(true),
                PropertyValue::Int(1),
                PropertyValue::Float(1.5),
                PropertyValue::Int(2),
                PropertyValue::String("a".into()),
            ]
        );
    }
}
