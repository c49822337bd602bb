//! Deterministic serialization of structured payloads.
//!
//! The mixer tag is computed over the serialized bytes of a payload, so
//! reserializing the same semantic value must always produce identical
//! bytes: map keys are emitted in sorted order, strings use a single
//! escaping rule, numbers use a single canonical form. We get all three for
//! free from `serde_json` as long as its `preserve_order` feature is never
//! enabled -- `serde_json::Map` is then backed by a `BTreeMap`, so key order
//! is sort order regardless of insertion order.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json as json;
use thiserror::Error;

/// A structured value: the only shapes a wire payload may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map() -> MapBuilder {
        MapBuilder(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

/// Small ergonomic builder so call sites read like a literal.
pub struct MapBuilder(BTreeMap<String, Value>);

impl MapBuilder {
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Value {
        Value::Map(self.0)
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

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&encode(self)))
    }
}

/// Lets a `Value` ride inside any other `serde`-derived type (e.g. the
/// control socket's command wire format), going through the same JSON
/// shape `encode`/`decode` use.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_json(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json_value = json::Value::deserialize(deserializer)?;
        from_json(json_value).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] json::Error),
    #[error("unsupported number (not representable as i64 or f64)")]
    UnsupportedNumber,
}

/// Serialize a value to its canonical byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let json_value = to_json(value);
    // `to_vec` never fails for a `serde_json::Value` built from only the
    // variants we produce below.
    json::to_vec(&json_value).expect("canonical value is always serializable")
}

/// Parse a canonical byte form back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let json_value: json::Value = json::from_slice(bytes)?;
    from_json(json_value)
}

fn to_json(value: &Value) -> json::Value {
    match value {
        Value::Null => json::Value::Null,
        Value::Bool(b) => json::Value::Bool(*b),
        Value::Int(n) => json::Value::Number((*n).into()),
        Value::Float(n) => json::Number::from_f64(*n)
            .map(json::Value::Number)
            .unwrap_or(json::Value::Null),
        Value::Str(s) => json::Value::String(s.clone()),
        Value::List(l) => json::Value::Array(l.iter().map(to_json).collect()),
        Value::Map(m) => {
            let mut obj = json::Map::new();
            for (k, v) in m {
                obj.insert(k.clone(), to_json(v));
            }
            json::Value::Object(obj)
        }
    }
}

fn from_json(value: json::Value) -> Result<Value, DecodeError> {
    Ok(match value {
        json::Value::Null => Value::Null,
        json::Value::Bool(b) => Value::Bool(b),
        json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(f) = n.as_f64() {
                Value::Float(f)
            } else {
                return Err(DecodeError::UnsupportedNumber);
            }
        }
        json::Value::String(s) => Value::Str(s),
        json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(from_json(item)?);
            }
            Value::List(out)
        }
        json::Value::Object(obj) => {
            let mut out = BTreeMap::new();
            for (k, v) in obj {
                out.insert(k, from_json(v)?);
            }
            Value::Map(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let value = Value::map()
            .field("type", "PING")
            .field("x", 1i64)
            .field("nested", Value::map().field("ok", true).build())
            .build();

        let bytes = encode(&value);
        let decoded = decode(&bytes).unwrap();

        assert_eq!(value, decoded);
    }

    #[test]
    fn map_keys_are_sorted_regardless_of_insertion_order() {
        let a = Value::map().field("b", 1i64).field("a", 2i64).build();
        let b = Value::map().field("a", 2i64).field("b", 1i64).build();

        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn encoding_is_deterministic_across_calls() {
        let value = Value::map()
            .field("peripherals", Value::List(vec![Value::map()
                .field("name", "me_bridge_0")
                .field("type", "battery")
                .build()]))
            .build();

        assert_eq!(encode(&value), encode(&value));
    }

    #[test]
    fn malformed_input_is_rejected() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[qcheck_macros::quickcheck]
    fn prop_scalar_round_trips(s: String, n: i64, b: bool) -> bool {
        let value = Value::map()
            .field("s", s.clone())
            .field("n", n)
            .field("b", b)
            .build();
        decode(&encode(&value)).unwrap() == value
    }

    #[qcheck_macros::quickcheck]
    fn prop_list_of_ints_round_trips(ints: Vec<i64>) -> bool {
        let value = Value::List(ints.into_iter().map(Value::from).collect());
        decode(&encode(&value)).unwrap() == value
    }

    #[qcheck_macros::quickcheck]
    fn prop_encoding_is_deterministic(s: String, n: i64) -> bool {
        let value = Value::map().field("s", s).field("n", n).build();
        encode(&value) == encode(&value)
    }
}
