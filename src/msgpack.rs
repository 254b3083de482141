//! The subset of MessagePack spoken by the bootloader firmware.
//!
//! Commands and answers are streams of concatenated MessagePack objects.
//! The firmware understands booleans, unsigned integers, strings, binary
//! blobs, short arrays and string-keyed maps; encoding always picks the
//! smallest representation and byte payloads always use the bin family,
//! never the str family.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

const NIL: u8 = 0xc0;
const FALSE: u8 = 0xc2;
const TRUE: u8 = 0xc3;
const BIN8: u8 = 0xc4;
const BIN16: u8 = 0xc5;
const BIN32: u8 = 0xc6;
const FLOAT32: u8 = 0xca;
const FLOAT64: u8 = 0xcb;
const UINT8: u8 = 0xcc;
const UINT16: u8 = 0xcd;
const UINT32: u8 = 0xce;
const UINT64: u8 = 0xcf;
const INT8: u8 = 0xd0;
const INT16: u8 = 0xd1;
const INT32: u8 = 0xd2;
const INT64: u8 = 0xd3;
const STR8: u8 = 0xd9;
const STR16: u8 = 0xda;
const ARRAY16: u8 = 0xdc;
const MAP16: u8 = 0xde;

const FIXMAP: u8 = 0x80;
const FIXARRAY: u8 = 0x90;
const FIXSTR: u8 = 0xa0;

/// A decoded MessagePack object.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Double(f64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Object is truncated.")]
    Truncated,
    #[error("Unsupported type marker {0:#04x}.")]
    UnsupportedMarker(u8),
    #[error("Map key is not a string.")]
    NonStringKey,
    #[error("String is not valid UTF-8.")]
    InvalidUtf8,
}

/// Appends the packed form of `value` to `out`.
pub fn pack(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Nil => out.push(NIL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::UInt(n) => pack_uint(*n, out),
        Value::Int(n) if *n >= 0 => pack_uint(*n as u64, out),
        Value::Int(n) => pack_int(*n, out),
        Value::Double(v) => {
            out.push(FLOAT64);
            let mut raw = [0; 8];
            BigEndian::write_f64(&mut raw, *v);
            out.extend_from_slice(&raw);
        }
        Value::Str(s) => pack_str(s, out),
        Value::Bin(b) => pack_bin(b, out),
        Value::Array(items) => {
            pack_array_header(items.len(), out);
            for item in items {
                pack(item, out);
            }
        }
        Value::Map(entries) => {
            pack_map_header(entries.len(), out);
            for (key, item) in entries {
                pack_str(key, out);
                pack(item, out);
            }
        }
    }
}

/// Packs `value` into a fresh byte vector.
pub fn pack_to_vec(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    pack(value, &mut out);
    out
}

fn pack_uint(n: u64, out: &mut Vec<u8>) {
    if n <= 0x7f {
        out.push(n as u8);
    } else if n <= 0xff {
        out.push(UINT8);
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(UINT16);
        push_u16(n as u16, out);
    } else if n <= 0xffff_ffff {
        out.push(UINT32);
        push_u32(n as u32, out);
    } else {
        out.push(UINT64);
        let mut raw = [0; 8];
        BigEndian::write_u64(&mut raw, n);
        out.extend_from_slice(&raw);
    }
}

fn pack_int(n: i64, out: &mut Vec<u8>) {
    if n >= -32 {
        out.push(n as u8);
    } else if n >= i64::from(i8::min_value()) {
        out.push(INT8);
        out.push(n as u8);
    } else if n >= i64::from(i16::min_value()) {
        out.push(INT16);
        push_u16(n as u16, out);
    } else if n >= i64::from(i32::min_value()) {
        out.push(INT32);
        push_u32(n as u32, out);
    } else {
        out.push(INT64);
        let mut raw = [0; 8];
        BigEndian::write_i64(&mut raw, n);
        out.extend_from_slice(&raw);
    }
}

fn pack_str(s: &str, out: &mut Vec<u8>) {
    let len = s.len();
    if len <= 31 {
        out.push(FIXSTR | len as u8);
    } else if len <= 0xff {
        out.push(STR8);
        out.push(len as u8);
    } else {
        out.push(STR16);
        push_u16(len as u16, out);
    }
    out.extend_from_slice(s.as_bytes());
}

fn pack_bin(b: &[u8], out: &mut Vec<u8>) {
    let len = b.len();
    if len <= 0xff {
        out.push(BIN8);
        out.push(len as u8);
    } else if len <= 0xffff {
        out.push(BIN16);
        push_u16(len as u16, out);
    } else {
        out.push(BIN32);
        push_u32(len as u32, out);
    }
    out.extend_from_slice(b);
}

fn pack_array_header(len: usize, out: &mut Vec<u8>) {
    if len <= 15 {
        out.push(FIXARRAY | len as u8);
    } else {
        out.push(ARRAY16);
        push_u16(len as u16, out);
    }
}

fn pack_map_header(len: usize, out: &mut Vec<u8>) {
    if len <= 15 {
        out.push(FIXMAP | len as u8);
    } else {
        out.push(MAP16);
        push_u16(len as u16, out);
    }
}

fn push_u16(n: u16, out: &mut Vec<u8>) {
    let mut raw = [0; 2];
    BigEndian::write_u16(&mut raw, n);
    out.extend_from_slice(&raw);
}

fn push_u32(n: u32, out: &mut Vec<u8>) {
    let mut raw = [0; 4];
    BigEndian::write_u32(&mut raw, n);
    out.extend_from_slice(&raw);
}

/// Streaming decoder over a byte slice.
///
/// Each call to [`Unpacker::unpack`] consumes exactly one object, so
/// concatenated objects (the command wire form) decode with repeated
/// calls.
pub struct Unpacker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Unpacker<'a> {
    pub fn new(buf: &'a [u8]) -> Unpacker<'a> {
        Unpacker { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn unpack(&mut self) -> Result<Value, DecodeError> {
        let marker = self.take_u8()?;
        match marker {
            0x00..=0x7f => Ok(Value::UInt(u64::from(marker))),
            0xe0..=0xff => Ok(Value::Int(i64::from(marker as i8))),
            m if m & 0xf0 == FIXMAP => self.unpack_map(usize::from(m & 0x0f)),
            m if m & 0xf0 == FIXARRAY => self.unpack_array(usize::from(m & 0x0f)),
            m if m & 0xe0 == FIXSTR => self.unpack_str(usize::from(m & 0x1f)),
            NIL => Ok(Value::Nil),
            FALSE => Ok(Value::Bool(false)),
            TRUE => Ok(Value::Bool(true)),
            BIN8 => {
                let len = usize::from(self.take_u8()?);
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            BIN16 => {
                let len = usize::from(self.take_u16()?);
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            BIN32 => {
                let len = self.take_u32()? as usize;
                Ok(Value::Bin(self.take(len)?.to_vec()))
            }
            FLOAT32 => Ok(Value::Double(f64::from(BigEndian::read_f32(
                self.take(4)?,
            )))),
            FLOAT64 => Ok(Value::Double(BigEndian::read_f64(self.take(8)?))),
            UINT8 => Ok(Value::UInt(u64::from(self.take_u8()?))),
            UINT16 => Ok(Value::UInt(u64::from(self.take_u16()?))),
            UINT32 => Ok(Value::UInt(u64::from(self.take_u32()?))),
            UINT64 => Ok(Value::UInt(BigEndian::read_u64(self.take(8)?))),
            INT8 => Ok(Value::Int(i64::from(self.take_u8()? as i8))),
            INT16 => Ok(Value::Int(i64::from(self.take_u16()? as i16))),
            INT32 => Ok(Value::Int(i64::from(self.take_u32()? as i32))),
            INT64 => Ok(Value::Int(BigEndian::read_i64(self.take(8)?))),
            STR8 => {
                let len = usize::from(self.take_u8()?);
                self.unpack_str(len)
            }
            STR16 => {
                let len = usize::from(self.take_u16()?);
                self.unpack_str(len)
            }
            ARRAY16 => {
                let len = usize::from(self.take_u16()?);
                self.unpack_array(len)
            }
            MAP16 => {
                let len = usize::from(self.take_u16()?);
                self.unpack_map(len)
            }
            other => Err(DecodeError::UnsupportedMarker(other)),
        }
    }

    fn unpack_str(&mut self, len: usize) -> Result<Value, DecodeError> {
        let raw = self.take(len)?.to_vec();
        String::from_utf8(raw)
            .map(Value::Str)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn unpack_array(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.unpack()?);
        }
        Ok(Value::Array(items))
    }

    fn unpack_map(&mut self, len: usize) -> Result<Value, DecodeError> {
        let mut entries = BTreeMap::new();
        for _ in 0..len {
            let key = match self.unpack()? {
                Value::Str(key) => key,
                _ => return Err(DecodeError::NonStringKey),
            };
            entries.insert(key, self.unpack()?);
        }
        Ok(Value::Map(entries))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self.as_u64() {
            Some(n) if n <= u64::from(u32::max_value()) => Some(n as u32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bin(&self) -> Option<&[u8]> {
        match self {
            Value::Bin(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Value {
        Value::UInt(u64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Value {
        Value::UInt(u64::from(n))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Value {
        Value::UInt(n)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Value {
        Value::UInt(n as u64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Value {
        Value::Bin(b)
    }
}

/// Renders a value as JSON; binary blobs become hex strings.
pub fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::from(*b),
        Value::UInt(n) => serde_json::Value::from(*n),
        Value::Int(n) => serde_json::Value::from(*n),
        Value::Double(v) => serde_json::Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Str(s) => serde_json::Value::from(s.as_str()),
        Value::Bin(b) => serde_json::Value::from(hex::encode(b)),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), to_json(item)))
                .collect(),
        ),
    }
}

/// Builds a value from parsed JSON, for configs coming from the command
/// line.
pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        serde_json::Value::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(key, item)| (key.clone(), from_json(item)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Value) {
        let packed = pack_to_vec(&value);
        let mut unpacker = Unpacker::new(&packed);
        assert_eq!(unpacker.unpack().unwrap(), value);
        assert_eq!(unpacker.remaining(), 0);
    }

    #[test]
    fn small_integers_use_fixint() {
        assert_eq!(pack_to_vec(&Value::UInt(0)), [0x00]);
        assert_eq!(pack_to_vec(&Value::UInt(0x7f)), [0x7f]);
    }

    #[test]
    fn integers_use_the_smallest_encoding() {
        assert_eq!(pack_to_vec(&Value::UInt(0x80)), [0xcc, 0x80]);
        assert_eq!(pack_to_vec(&Value::UInt(0x1234)), [0xcd, 0x12, 0x34]);
        assert_eq!(
            pack_to_vec(&Value::UInt(0xDEAD_BEEF)),
            [0xce, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn bytes_use_the_bin_family() {
        assert_eq!(pack_to_vec(&Value::Bin(vec![12])), [0xc4, 1, 12]);
    }

    #[test]
    fn strings_use_fixstr_when_short() {
        assert_eq!(pack_to_vec(&Value::from("abc")), [0xa3, b'a', b'b', b'c']);
    }

    #[test]
    fn booleans() {
        assert_eq!(pack_to_vec(&Value::Bool(false)), [0xc2]);
        assert_eq!(pack_to_vec(&Value::Bool(true)), [0xc3]);
    }

    #[test]
    fn array_header_is_fixarray() {
        let value = Value::Array(vec![Value::UInt(1), Value::UInt(2)]);
        assert_eq!(pack_to_vec(&value)[0], 0x92);
    }

    #[test]
    fn values_round_trip() {
        round_trip(Value::Nil);
        round_trip(Value::UInt(0xDEAD_BEEF_CAFE));
        round_trip(Value::Int(-42));
        round_trip(Value::Int(-4200));
        round_trip(Value::Double(3.25));
        round_trip(Value::Str("device".repeat(12)));
        round_trip(Value::Bin((0..=255).collect()));
        round_trip(Value::Array(vec![
            Value::Bool(true),
            Value::Bin(vec![1, 2, 3]),
            Value::Str("x".to_string()),
        ]));

        let mut entries = BTreeMap::new();
        entries.insert("ID".to_string(), Value::UInt(12));
        entries.insert("name".to_string(), Value::from("arm"));
        round_trip(Value::Map(entries));
    }

    #[test]
    fn large_array_round_trips() {
        round_trip(Value::Array((0..100u64).map(Value::UInt).collect()));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let packed = pack_to_vec(&Value::UInt(0x1234));
        assert!(matches!(
            Unpacker::new(&packed[..2]).unpack(),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn concatenated_objects_decode_in_order() {
        let mut buf = Vec::new();
        pack(&Value::UInt(2), &mut buf);
        pack(&Value::UInt(5), &mut buf);
        pack(&Value::Array(vec![]), &mut buf);

        let mut unpacker = Unpacker::new(&buf);
        assert_eq!(unpacker.unpack().unwrap(), Value::UInt(2));
        assert_eq!(unpacker.unpack().unwrap(), Value::UInt(5));
        assert_eq!(unpacker.unpack().unwrap(), Value::Array(vec![]));
        assert_eq!(unpacker.remaining(), 0);
    }

    #[test]
    fn json_round_trip_for_configs() {
        let mut entries = BTreeMap::new();
        entries.insert("application_size".to_string(), Value::UInt(4096));
        entries.insert("name".to_string(), Value::from("beacon"));
        entries.insert("calibrated".to_string(), Value::Bool(true));
        let value = Value::Map(entries);

        assert_eq!(from_json(&to_json(&value)), value);
    }
}
