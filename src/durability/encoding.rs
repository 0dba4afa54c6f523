use std::io::Write;

use crate::error::{Result, StorageError};
use crate::props::{decode_value, encode_value, PropertyValue};

/// Append-only byte buffer with the fixed-width big-endian framing shared
/// by the WAL and snapshot formats.
#[derive(Debug, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_value(&mut self, value: &PropertyValue) {
        encode_value(&mut self.buf, value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice, mirroring [`Encoder`].
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| StorageError::Corruption("length overflow".into()))?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| StorageError::Corruption("unexpected end of data".into()))?;
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| StorageError::Corruption("invalid utf-8 string".into()))
    }

    pub fn read_value(&mut self) -> Result<PropertyValue> {
        let mut pos = self.pos;
        let value = decode_value(self.data, &mut pos)?;
        self.pos = pos;
        Ok(value)
    }
}

/// Write adapter that tracks a running CRC-32 and byte count, used for the
/// whole-file snapshot checksum.
pub(crate) struct ChecksumWriter<W: Write> {
    inner: W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.hasher.update(bytes);
        self.written += bytes.len() as u64;
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.written
    }

    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_primitives() {
        let mut enc = Encoder::new();
        enc.write_u8(7);
        enc.write_u32(42);
        enc.write_u64(1 << 40);
        enc.write_string("Person");
        enc.write_value(&PropertyValue::Int(-5));
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        assert_eq!(dec.read_u8().unwrap(), 7);
        assert_eq!(dec.read_u32().unwrap(), 42);
        assert_eq!(dec.read_u64().unwrap(), 1 << 40);
        assert_eq!(dec.read_string().unwrap(), "Person");
        assert_eq!(dec.read_value().unwrap(), PropertyValue::Int(-5));
        assert!(dec.at_end());
    }

    #[test]
    fn truncated_string_is_corruption() {
        let mut enc = Encoder::new();
        enc.write_string("truncate me");
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes[..bytes.len() - 2]);
        assert!(matches!(
            dec.read_string(),
            Err(StorageError::Corruption(_))
        ));
    }
}
