//! Typed metadata values.
//!
//! Every stored row owns a bag of `key -> Value` pairs. Values form a small
//! JSON-like union with a fixed little-endian binary encoding used by the
//! snapshot and WAL formats:
//!
//! - `type_tag(u8)` followed by the payload per kind.
//! - null: empty; int64/float64: 8 bytes; bool: 1 byte;
//!   string: `len(u32) | bytes`;
//!   array: `element_tag(u8) | count(u32) | payloads` (homogeneous);
//!   object: `count(u32) | (key_len(u32) | key | value)*`.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// A metadata bag attached to a row. Keys are non-empty and unique.
pub type Metadata = BTreeMap<String, Value>;

/// A typed metadata value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_OBJECT: u8 = 6;

impl Value {
    /// The wire tag for this value's kind.
    pub fn type_tag(&self) -> u8 {
        match self {
            Value::Null => TAG_NULL,
            Value::Integer(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::Bool(_) => TAG_BOOL,
            Value::String(_) => TAG_STRING,
            Value::Array(_) => TAG_ARRAY,
            Value::Object(_) => TAG_OBJECT,
        }
    }

    /// Compares two values of the same kind. Integer and float cross-compare
    /// numerically; any other cross-kind comparison is undefined and returns
    /// None.
    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp_same_type(y) {
                        Some(Ordering::Equal) => continue,
                        other => return other,
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// A total order over all values, kind tag first. Used to keep payload
    /// index arrays sorted; query semantics still go through
    /// [`Value::cmp_same_type`].
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match self.type_tag().cmp(&other.type_tag()) {
            Ordering::Equal => self.cmp_same_type(other).unwrap_or(Ordering::Equal),
            other => other,
        }
    }

    /// Encodes the value, tag included.
    pub fn encode<W: Write>(&self, w: &mut W) -> CResult<()> {
        w.write_u8(self.type_tag())?;
        self.encode_payload(w)
    }

    fn encode_payload<W: Write>(&self, w: &mut W) -> CResult<()> {
        match self {
            Value::Null => {}
            Value::Integer(v) => w.write_i64::<LittleEndian>(*v)?,
            Value::Float(v) => w.write_f64::<LittleEndian>(*v)?,
            Value::Bool(v) => w.write_u8(*v as u8)?,
            Value::String(s) => {
                w.write_u32::<LittleEndian>(s.len() as u32)?;
                w.write_all(s.as_bytes())?;
            }
            Value::Array(items) => {
                let element_tag = items.first().map_or(TAG_NULL, |v| v.type_tag());
                if items.iter().any(|v| v.type_tag() != element_tag) {
                    return Err(Error::InvalidInput("array values must be homogeneous".into()));
                }
                w.write_u8(element_tag)?;
                w.write_u32::<LittleEndian>(items.len() as u32)?;
                for item in items {
                    item.encode_payload(w)?;
                }
            }
            Value::Object(map) => {
                w.write_u32::<LittleEndian>(map.len() as u32)?;
                for (key, value) in map {
                    w.write_u32::<LittleEndian>(key.len() as u32)?;
                    w.write_all(key.as_bytes())?;
                    value.encode(w)?;
                }
            }
        }
        Ok(())
    }

    /// Decodes a value, tag included.
    pub fn decode<R: Read>(r: &mut R) -> CResult<Value> {
        let tag = r.read_u8()?;
        Self::decode_payload(r, tag)
    }

    fn decode_payload<R: Read>(r: &mut R, tag: u8) -> CResult<Value> {
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_INT => Value::Integer(r.read_i64::<LittleEndian>()?),
            TAG_FLOAT => Value::Float(r.read_f64::<LittleEndian>()?),
            TAG_BOOL => Value::Bool(r.read_u8()? != 0),
            TAG_STRING => {
                let len = r.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0; len];
                r.read_exact(&mut buf)?;
                Value::String(
                    String::from_utf8(buf)
                        .map_err(|_| Error::Corrupted("string value is not utf-8".into()))?,
                )
            }
            TAG_ARRAY => {
                let element_tag = r.read_u8()?;
                let count = r.read_u32::<LittleEndian>()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(Self::decode_payload(r, element_tag)?);
                }
                Value::Array(items)
            }
            TAG_OBJECT => {
                let count = r.read_u32::<LittleEndian>()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key_len = r.read_u32::<LittleEndian>()? as usize;
                    let mut key = vec![0; key_len];
                    r.read_exact(&mut key)?;
                    let key = String::from_utf8(key)
                        .map_err(|_| Error::Corrupted("object key is not utf-8".into()))?;
                    map.insert(key, Value::decode(r)?);
                }
                Value::Object(map)
            }
            other => return Err(Error::Corrupted(format!("unknown value tag {}", other))),
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Encodes a whole metadata bag as `count(u32) | (key_len | key | value)*`.
pub fn encode_metadata<W: Write>(w: &mut W, meta: &Metadata) -> CResult<()> {
    w.write_u32::<LittleEndian>(meta.len() as u32)?;
    for (key, value) in meta {
        w.write_u32::<LittleEndian>(key.len() as u32)?;
        w.write_all(key.as_bytes())?;
        value.encode(w)?;
    }
    Ok(())
}

/// Decodes a metadata bag written by [`encode_metadata`].
pub fn decode_metadata<R: Read>(r: &mut R) -> CResult<Metadata> {
    let count = r.read_u32::<LittleEndian>()? as usize;
    let mut meta = BTreeMap::new();
    for _ in 0..count {
        let key_len = r.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0; key_len];
        r.read_exact(&mut key)?;
        let key = String::from_utf8(key)
            .map_err(|_| Error::Corrupted("metadata key is not utf-8".into()))?;
        meta.insert(key, Value::decode(r)?);
    }
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn round_trip(value: Value) {
        let mut buf = Vec::new();
        value.encode(&mut buf).unwrap();
        let decoded = Value::decode(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn encode_all_kinds() {
        round_trip(Value::Null);
        round_trip(Value::Integer(-42));
        round_trip(Value::Float(3.5));
        round_trip(Value::Bool(true));
        round_trip(Value::String("héllo".into()));
        round_trip(Value::Array(vec![Value::Integer(1), Value::Integer(2)]));
        round_trip(Value::Object(BTreeMap::from([
            ("a".to_string(), Value::Integer(1)),
            ("b".to_string(), Value::Array(vec![Value::String("x".into())])),
        ])));
    }

    #[test]
    fn heterogeneous_array_rejected() {
        let mut buf = Vec::new();
        let v = Value::Array(vec![Value::Integer(1), Value::String("x".into())]);
        assert!(v.encode(&mut buf).is_err());
    }

    #[test]
    fn numeric_cross_compare() {
        assert_eq!(
            Value::Integer(2).cmp_same_type(&Value::Float(2.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Float(1.5).cmp_same_type(&Value::Integer(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::String("1".into()).cmp_same_type(&Value::Integer(1)), None);
    }

    #[test]
    fn untagged_json() {
        let v = Value::Object(BTreeMap::from([
            ("n".to_string(), Value::Integer(5)),
            ("s".to_string(), Value::String("hi".into())),
        ]));
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"n":5,"s":"hi"}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn metadata_round_trip() {
        let meta = Metadata::from([
            ("color".to_string(), Value::String("red".into())),
            ("rank".to_string(), Value::Integer(3)),
        ]);
        let mut buf = Vec::new();
        encode_metadata(&mut buf, &meta).unwrap();
        assert_eq!(decode_metadata(&mut buf.as_slice()).unwrap(), meta);
    }
}
