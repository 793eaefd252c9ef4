use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{self, Document};

/// How a join path whose final value is an array produces keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayKeys {
    /// The array is a single key, compared element by element.
    #[default]
    Whole,
    /// Each element of the array is a key of its own.
    Elements,
}

/// Hashable, normalised form of a JSON value used as a join key.
///
/// Numbers compare by value: `1`, `1.0` and `-0.0`/`0` collapse onto the same
/// integer key. Integers above `i64::MAX` keep their exact value as
/// `Unsigned`. Floats that are not whole keep their bit pattern, with every
/// NaN folded onto one canonical NaN. Embedded documents compare field by
/// field in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinKey {
    Null,
    Boolean(bool),
    Integer(i64),
    Unsigned(u64),
    Float(u64),
    String(String),
    Array(Vec<JoinKey>),
    Document(Vec<(String, JoinKey)>),
}

impl JoinKey {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => JoinKey::Null,
            Value::Bool(b) => JoinKey::Boolean(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    JoinKey::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    JoinKey::Unsigned(u)
                } else if let Some(f) = n.as_f64() {
                    Self::from_f64(f)
                } else {
                    JoinKey::Null
                }
            }
            Value::String(s) => JoinKey::String(s.clone()),
            Value::Array(items) => JoinKey::Array(items.iter().map(Self::from_json).collect()),
            Value::Object(map) => JoinKey::Document(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    fn from_f64(f: f64) -> Self {
        if f.is_nan() {
            return JoinKey::Float(f64::NAN.to_bits());
        }
        // i64::MAX as f64 and u64::MAX as f64 round up to 2^63 and 2^64, so
        // both bounds are exclusive and every whole float in range is exact.
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
            return JoinKey::Integer(f as i64);
        }
        if f.fract() == 0.0 && f >= 0.0 && f < u64::MAX as f64 {
            return JoinKey::Unsigned(f as u64);
        }
        JoinKey::Float(f.to_bits())
    }

    /// Convert this key back to a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            JoinKey::Null => Value::Null,
            JoinKey::Boolean(b) => Value::Bool(*b),
            JoinKey::Integer(i) => Value::Number((*i).into()),
            JoinKey::Unsigned(u) => Value::Number((*u).into()),
            JoinKey::Float(bits) => serde_json::Number::from_f64(f64::from_bits(*bits))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            JoinKey::String(s) => Value::String(s.clone()),
            JoinKey::Array(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            JoinKey::Document(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Extract the join keys found at `path` in `doc`.
///
/// An absent path yields no keys, so the document can never match. Arrays
/// crossed mid-path always fan out; a final array value is expanded only
/// under [`ArrayKeys::Elements`].
pub fn join_keys(doc: &Document, path: &str, arrays: ArrayKeys) -> Vec<JoinKey> {
    let resolved = document::resolve(doc, path);
    if resolved.is_absent() {
        return Vec::new();
    }
    let mut keys = Vec::new();
    for value in resolved.values() {
        match (value, arrays) {
            (Value::Array(items), ArrayKeys::Elements) => {
                keys.extend(items.iter().map(JoinKey::from_json));
            }
            _ => keys.push(JoinKey::from_json(value)),
        }
    }
    keys.dedup();
    keys
}
