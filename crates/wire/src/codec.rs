//! Little-endian primitive encoding.
//!
//! All integers are fixed-width little-endian. Strings are
//! `[u32 len][utf8 bytes]`, arrays are `[u32 count][elements]`, maps are
//! arrays of key/value pairs in key order. Durations travel as `i64`
//! nanoseconds.
//!
//! Readers never assume they consume the whole payload: a versioned message
//! may grow trailing fields that older readers skip, so leftover bytes after
//! a successful decode are legal.

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::time::Duration;

/// Serialize into a growable little-endian buffer.
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16_le(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    /// Length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    /// Raw bytes without a length prefix (nested pre-encoded payloads).
    pub fn put_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn put_duration(&mut self, value: Duration) {
        self.put_i64(value.as_nanos() as i64);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a received payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let available = self.buf.len() - self.pos;
        if available < n {
            return Err(WireError::UnexpectedEof {
                needed: n,
                available,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        Ok(self.u64()? as i64)
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn duration(&mut self) -> Result<Duration, WireError> {
        let nanos = self.i64()?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }

    /// Bytes not yet consumed. Trailing data after a decode is legal
    /// (versioned payload growth).
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// A value that serializes itself into a [`Writer`].
pub trait Encode {
    fn encode(&self, w: &mut Writer);

    fn to_bytes(&self) -> Bytes {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.freeze()
    }
}

/// A value that deserializes itself from a [`Reader`].
pub trait Decode: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Self::decode(&mut Reader::new(bytes))
    }
}

impl Encode for String {
    fn encode(&self, w: &mut Writer) {
        w.put_string(self);
    }
}

impl Decode for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.string()
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, w: &mut Writer) {
        w.put_bytes(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        r.bytes()
    }
}

/// Arrays of any encodable element: `[u32 count][elements]`.
pub fn encode_vec<T: Encode>(items: &[T], w: &mut Writer) {
    w.put_u32(items.len() as u32);
    for item in items {
        item.encode(w);
    }
}

pub fn decode_vec<T: Decode>(r: &mut Reader<'_>) -> Result<Vec<T>, WireError> {
    let count = r.u32()? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(T::decode(r)?);
    }
    Ok(items)
}

/// Maps as key-ordered pair arrays, so serialization is deterministic.
pub fn encode_string_map(map: &BTreeMap<String, String>, w: &mut Writer) {
    w.put_u32(map.len() as u32);
    for (key, value) in map {
        w.put_string(key);
        w.put_string(value);
    }
}

pub fn decode_string_map(r: &mut Reader<'_>) -> Result<BTreeMap<String, String>, WireError> {
    let count = r.u32()? as usize;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = r.string()?;
        let value = r.string()?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_roundtrip() {
        let mut w = Writer::new();
        w.put_u8(0xAB);
        w.put_u16(0x1234);
        w.put_u32(0xDEAD_BEEF);
        w.put_u64(u64::MAX);
        w.put_i64(-42);
        w.put_bool(true);
        let bytes = w.freeze();

        let mut r = Reader::new(&bytes);
        assert_eq!(r.u8().unwrap(), 0xAB);
        assert_eq!(r.u16().unwrap(), 0x1234);
        assert_eq!(r.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.u64().unwrap(), u64::MAX);
        assert_eq!(r.i64().unwrap(), -42);
        assert!(r.bool().unwrap());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_integers_are_little_endian() {
        let mut w = Writer::new();
        w.put_u32(0x0102_0304);
        assert_eq!(&w.freeze()[..], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_string_roundtrip() {
        let mut w = Writer::new();
        w.put_string("Käfer");
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.string().unwrap(), "Käfer");
    }

    #[test]
    fn test_truncated_read_reports_eof() {
        let mut w = Writer::new();
        w.put_u32(10); // claims 10 bytes of string data
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert!(matches!(
            r.string(),
            Err(WireError::UnexpectedEof { needed: 10, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut w = Writer::new();
        w.put_bytes(&[0xFF, 0xFE]);
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.string(), Err(WireError::InvalidUtf8));
    }

    #[test]
    fn test_vec_roundtrip() {
        let items = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
        let mut w = Writer::new();
        encode_vec(&items, &mut w);
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert_eq!(decode_vec::<String>(&mut r).unwrap(), items);
    }

    #[test]
    fn test_string_map_is_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("z".to_string(), "1".to_string());
        map.insert("a".to_string(), "2".to_string());

        let mut w1 = Writer::new();
        encode_string_map(&map, &mut w1);
        let mut w2 = Writer::new();
        encode_string_map(&map.clone(), &mut w2);
        assert_eq!(w1.freeze(), w2.freeze());
    }

    #[test]
    fn test_trailing_bytes_are_legal() {
        let mut w = Writer::new();
        w.put_u32(7);
        w.put_raw(&[1, 2, 3]); // unknown future fields
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.remaining(), 3);
    }

    #[test]
    fn test_duration_as_nanos() {
        let mut w = Writer::new();
        w.put_duration(Duration::from_millis(1));
        let bytes = w.freeze();
        let mut r = Reader::new(&bytes);
        assert_eq!(r.duration().unwrap(), Duration::from_millis(1));
    }
}
