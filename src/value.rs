//! Self-describing value type used for a point's opaque `data` blob.
//!
//! The wire contract (spec §6) only requires that `data` be "a self
//! describing map using a length-prefixed binary object encoding"; this
//! crate represents that map as [`Value`], persisted as opaque bytes via
//! `bincode` at the Disk Store boundary and decoded only when `select`/
//! `sort` need to walk a property path.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A dynamically typed, self-describing value.
///
/// `Map` uses a `BTreeMap` (not a hash map) so that encoding the same
/// logical document twice always produces the same bytes, which the Disk
/// Store's durable backend relies on when computing content-stable keys for
/// tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// String-keyed nested map.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Encodes this value into its opaque on-disk byte representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("encode data blob: {e}")))
    }

    /// Decodes an opaque on-disk byte representation back into a `Value`.
    pub fn decode(bytes: &[u8]) -> Result<Value> {
        bincode::deserialize(bytes).map_err(|e| Error::internal(format!("decode data blob: {e}")))
    }

    /// Resolves a dotted property path (`"a.b.c"`) against this value,
    /// walking nested maps. Returns `None` if any segment is missing or the
    /// value at some point is not a map.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> Option<&Value> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                Value::Map(m) => current = m.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Best-effort total ordering used by `sort` requests; `Null` sorts
    /// first, incomparable types compare equal (stable by insertion order
    /// upstream).
    #[must_use]
    pub fn cmp_for_sort(&self, other: &Value) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Integer(a), Value::Float(b)) => {
                (*a as f64).partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (Value::Float(a), Value::Integer(b)) => {
                a.partial_cmp(&(*b as f64)).unwrap_or(Ordering::Equal)
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}
