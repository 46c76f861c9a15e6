//! Self-describing key/value map and its framed wire encoding.
//!
//! A frame on the socket is `[size: u64 LE][payload: <size> bytes]`. The
//! payload packs a `KvMap` as a little-endian `u32` entry count followed by
//! that many `[key len: u16 LE][key bytes][tag: u8][value]` records. This
//! mirrors how the agent's own packed map is laid out closely enough that a
//! real agent implementation need only match the tag assignments below.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::VdevError;

const TAG_STRING: u8 = 1;
const TAG_U64: u8 = 2;
const TAG_BYTES: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    U64(u64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// A packed key/value map, the payload half of a wire frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvMap(HashMap<String, Value>);

impl KvMap {
    pub fn new() -> Self {
        KvMap(HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str, VdevError> {
        self.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| VdevError::protocol(format!("missing or wrong-typed field `{key}`")))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, VdevError> {
        self.get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| VdevError::protocol(format!("missing or wrong-typed field `{key}`")))
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.get(key).and_then(Value::as_bytes)
    }

    /// Packs this map into its wire payload (no length prefix).
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.0.len() as u32).unwrap();
        for (key, value) in &self.0 {
            let key_bytes = key.as_bytes();
            out.write_u16::<LittleEndian>(key_bytes.len() as u16).unwrap();
            out.write_all(key_bytes).unwrap();
            match value {
                Value::Str(s) => {
                    out.write_u8(TAG_STRING).unwrap();
                    out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
                    out.write_all(s.as_bytes()).unwrap();
                }
                Value::U64(v) => {
                    out.write_u8(TAG_U64).unwrap();
                    out.write_u64::<LittleEndian>(*v).unwrap();
                }
                Value::Bytes(b) => {
                    out.write_u8(TAG_BYTES).unwrap();
                    out.write_u32::<LittleEndian>(b.len() as u32).unwrap();
                    out.write_all(b).unwrap();
                }
            }
        }
        out
    }

    /// Decodes a payload previously produced by [`KvMap::pack`].
    pub fn unpack(payload: &[u8]) -> Result<Self, VdevError> {
        let mut cur = Cursor::new(payload);
        let count = cur
            .read_u32::<LittleEndian>()
            .map_err(|e| VdevError::protocol(format!("truncated map header: {e}")))?;
        let mut map = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let key_len = cur
                .read_u16::<LittleEndian>()
                .map_err(|e| VdevError::protocol(format!("truncated key length: {e}")))?;
            let mut key_bytes = vec![0u8; key_len as usize];
            cur.read_exact(&mut key_bytes)
                .map_err(|e| VdevError::protocol(format!("truncated key: {e}")))?;
            let key = String::from_utf8(key_bytes)
                .map_err(|e| VdevError::protocol(format!("key not utf8: {e}")))?;
            let tag = cur
                .read_u8()
                .map_err(|e| VdevError::protocol(format!("truncated tag: {e}")))?;
            let value = match tag {
                TAG_STRING => {
                    let len = cur
                        .read_u32::<LittleEndian>()
                        .map_err(|e| VdevError::protocol(format!("truncated string length: {e}")))?;
                    let mut buf = vec![0u8; len as usize];
                    cur.read_exact(&mut buf)
                        .map_err(|e| VdevError::protocol(format!("truncated string: {e}")))?;
                    Value::Str(
                        String::from_utf8(buf)
                            .map_err(|e| VdevError::protocol(format!("value not utf8: {e}")))?,
                    )
                }
                TAG_U64 => Value::U64(
                    cur.read_u64::<LittleEndian>()
                        .map_err(|e| VdevError::protocol(format!("truncated u64: {e}")))?,
                ),
                TAG_BYTES => {
                    let len = cur
                        .read_u32::<LittleEndian>()
                        .map_err(|e| VdevError::protocol(format!("truncated bytes length: {e}")))?;
                    let mut buf = vec![0u8; len as usize];
                    cur.read_exact(&mut buf)
                        .map_err(|e| VdevError::protocol(format!("truncated bytes: {e}")))?;
                    Value::Bytes(buf)
                }
                other => {
                    return Err(VdevError::protocol(format!("unknown value tag {other}")));
                }
            };
            map.insert(key, value);
        }
        Ok(KvMap(map))
    }

    /// Frames this map for the wire: `[size: u64 LE][payload]`.
    pub fn to_frame(&self) -> Vec<u8> {
        let payload = self.pack();
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
        frame.extend_from_slice(&payload);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_value_kinds() {
        let mut map = KvMap::new();
        map.insert("name", "mypool");
        map.insert("GUID", 0xdead_beefu64);
        map.insert("data", vec![1u8, 2, 3, 4, 5]);

        let packed = map.pack();
        let decoded = KvMap::unpack(&packed).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn empty_map_round_trips() {
        let map = KvMap::new();
        let decoded = KvMap::unpack(&map.pack()).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn frame_carries_correct_length_prefix() {
        let mut map = KvMap::new();
        map.insert("Type", "read block");
        let frame = map.to_frame();
        let size = u64::from_le_bytes(frame[0..8].try_into().unwrap());
        assert_eq!(size as usize, frame.len() - 8);
    }

    #[test]
    fn unpack_rejects_truncated_payload() {
        let mut map = KvMap::new();
        map.insert("Type", "open pool");
        let packed = map.pack();
        let truncated = &packed[..packed.len() - 2];
        assert!(KvMap::unpack(truncated).is_err());
    }

    #[test]
    fn unpack_rejects_unknown_tag() {
        // one entry, key "x", tag 99
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(1).unwrap();
        buf.write_u16::<LittleEndian>(1).unwrap();
        buf.write_all(b"x").unwrap();
        buf.write_u8(99).unwrap();
        assert!(KvMap::unpack(&buf).is_err());
    }
}
