//! Typed immutable values.
//!
//! [`Value`] is a closed sum type. Collections (`List`, `Map`, `Set`) wrap a
//! [`Sequence`], which is either a single leaf embedded in the value's own
//! encoding or the root of a chunked prolly tree. Which representation a
//! collection uses depends only on its contents, so two logically equal values
//! always encode to the same bytes and derived equality is logical equality.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::Ref;
use crate::node::Node;

/// Discriminant of a [`Value`], used for typed reads and schema checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Bool,
    Number,
    String,
    Bytes,
    Ref,
    List,
    Map,
    Set,
    Struct,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Bool => "Bool",
            Kind::Number => "Number",
            Kind::String => "String",
            Kind::Bytes => "Bytes",
            Kind::Ref => "Ref",
            Kind::List => "List",
            Kind::Map => "Map",
            Kind::Set => "Set",
            Kind::Struct => "Struct",
        };
        f.write_str(name)
    }
}

/// A float with a single canonical encoding.
///
/// `-0.0` is stored as `0.0` and every NaN as the same quiet NaN, so equal
/// numbers always hash to the same chunk. Equality is bitwise on the canonical
/// form, which makes `Number` usable as `Eq`.
#[derive(Clone, Copy)]
pub struct Number(f64);

impl Number {
    pub fn new(value: f64) -> Number {
        if value.is_nan() {
            Number(f64::NAN)
        } else if value == 0.0 {
            Number(0.0)
        } else {
            Number(value)
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// The value as an integer, if it is one exactly.
    pub fn as_u64(self) -> Option<u64> {
        if self.0 >= 0.0 && self.0.fract() == 0.0 && self.0 <= u64::MAX as f64 {
            Some(self.0 as u64)
        } else {
            None
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Number {}

impl fmt::Debug for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.0)
    }
}

impl<'de> Deserialize<'de> for Number {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        f64::deserialize(deserializer).map(Number::new)
    }
}

/// Items of a collection, either embedded or stored as a prolly tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequence {
    /// A single leaf small enough to live inside the enclosing chunk
    Inline(Node),
    /// Root of a chunked tree holding `count` items
    Chunked { root: Ref, count: u64 },
}

impl Sequence {
    pub fn len(&self) -> u64 {
        match self {
            Sequence::Inline(node) => node.len() as u64,
            Sequence::Chunked { count, .. } => *count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root(&self) -> Option<Ref> {
        match self {
            Sequence::Inline(_) => None,
            Sequence::Chunked { root, .. } => Some(*root),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Sequence::Chunked { .. })
    }
}

/// Ordered list of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List(pub(crate) Sequence);

/// Key-sorted map. Keys are ordered by their canonical encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Map(pub(crate) Sequence);

/// Sorted set, ordered like map keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Set(pub(crate) Sequence);

macro_rules! collection_accessors {
    ($($ty:ident),*) => {
        $(
            impl $ty {
                pub fn len(&self) -> u64 {
                    self.0.len()
                }

                pub fn is_empty(&self) -> bool {
                    self.0.is_empty()
                }

                pub fn sequence(&self) -> &Sequence {
                    &self.0
                }
            }
        )*
    };
}

collection_accessors!(List, Map, Set);

/// Named record with fields in a stable (sorted) order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Struct {
    pub name: String,
    pub fields: BTreeMap<String, Value>,
}

impl Struct {
    pub fn new(name: impl Into<String>) -> Self {
        Struct {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// A typed immutable datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Number(Number),
    String(String),
    Bytes(Vec<u8>),
    Ref(Ref),
    List(List),
    Map(Map),
    Set(Set),
    Struct(Struct),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Bool(_) => Kind::Bool,
            Value::Number(_) => Kind::Number,
            Value::String(_) => Kind::String,
            Value::Bytes(_) => Kind::Bytes,
            Value::Ref(_) => Kind::Ref,
            Value::List(_) => Kind::List,
            Value::Map(_) => Kind::Map,
            Value::Set(_) => Kind::Set,
            Value::Struct(_) => Kind::Struct,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(n.get()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn to_ref(&self) -> Option<Ref> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&List> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&Set> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Struct> {
        match self {
            Value::Struct(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(Number::new(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(Number::new(n as f64))
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(Number::new(n as f64))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(Number::new(n as f64))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Ref> for Value {
    fn from(r: Ref) -> Self {
        Value::Ref(r)
    }
}

impl From<List> for Value {
    fn from(l: List) -> Self {
        Value::List(l)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Value::Map(m)
    }
}

impl From<Set> for Value {
    fn from(s: Set) -> Self {
        Value::Set(s)
    }
}

impl From<Struct> for Value {
    fn from(s: Struct) -> Self {
        Value::Struct(s)
    }
}
