//! Commit values.
//!
//! A commit is stored as an ordinary value:
//!
//! ```text
//! Commit {
//!     value:   Ref,
//!     parents: List<Ref>,            // declaration order, no duplicates
//!     meta:    Meta { author, message, timestamp },
//!     height:  Number,               // 1 + max(parent heights), 1 for roots
//! }
//! ```
//!
//! Its ref is therefore a pure function of the value, the parents and the
//! metadata.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::value::{List, Number, Struct, Value};
use crate::value_store::ValueStore;

pub const COMMIT_STRUCT: &str = "Commit";
pub const META_STRUCT: &str = "Meta";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMeta {
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitMeta {
    pub fn new(author: impl Into<String>, message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        CommitMeta {
            author: author.into(),
            message: message.into(),
            timestamp,
        }
    }

    /// Metadata stamped with the current time.
    pub fn now(author: impl Into<String>, message: impl Into<String>) -> Self {
        CommitMeta::new(author, message, Utc::now())
    }

    fn to_value(&self) -> Value {
        Value::Struct(
            Struct::new(META_STRUCT)
                .with("author", self.author.as_str())
                .with("message", self.message.as_str())
                .with(
                    "timestamp",
                    self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                ),
        )
    }

    fn from_value(value: &Value) -> Result<Self> {
        let meta = struct_named(value, META_STRUCT)?;
        let timestamp = string_field(meta, "timestamp")?;
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| Error::CorruptEncoding(format!("commit timestamp {:?}: {}", timestamp, e)))?
            .with_timezone(&Utc);
        Ok(CommitMeta {
            author: string_field(meta, "author")?.to_string(),
            message: string_field(meta, "message")?.to_string(),
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub value: Ref,
    pub parents: Vec<Ref>,
    pub meta: CommitMeta,
    pub height: u64,
}

impl Commit {
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn to_value(&self, vs: &ValueStore) -> Result<Value> {
        let parents = List::from_values(vs, self.parents.iter().map(|p| Value::Ref(*p)))?;
        Ok(Value::Struct(
            Struct::new(COMMIT_STRUCT)
                .with("value", self.value)
                .with("parents", parents)
                .with("meta", self.meta.to_value())
                .with("height", self.height),
        ))
    }

    pub fn from_value(vs: &ValueStore, value: &Value) -> Result<Self> {
        let commit = struct_named(value, COMMIT_STRUCT)?;

        let value_ref = field(commit, "value")?
            .to_ref()
            .ok_or_else(|| malformed("value is not a ref"))?;

        let list = field(commit, "parents")?
            .as_list()
            .ok_or_else(|| malformed("parents is not a list"))?;
        let parents = list
            .iter(vs)?
            .map(|parent| parent?.to_ref().ok_or_else(|| malformed("parent is not a ref")))
            .collect::<Result<Vec<Ref>>>()?;

        let height = field(commit, "height")?
            .as_number()
            .and_then(|n| Number::new(n).as_u64())
            .ok_or_else(|| malformed("height is not a whole number"))?;

        Ok(Commit {
            value: value_ref,
            parents,
            meta: CommitMeta::from_value(field(commit, "meta")?)?,
            height,
        })
    }
}

fn malformed(what: &str) -> Error {
    Error::CorruptEncoding(format!("malformed commit: {}", what))
}

fn struct_named<'v>(value: &'v Value, name: &str) -> Result<&'v Struct> {
    match value.as_struct() {
        Some(s) if s.name == name => Ok(s),
        _ => Err(Error::CorruptEncoding(format!(
            "expected a {} struct, found {}",
            name,
            value.kind()
        ))),
    }
}

fn field<'v>(s: &'v Struct, name: &str) -> Result<&'v Value> {
    s.get(name)
        .ok_or_else(|| Error::CorruptEncoding(format!("{} struct has no field {:?}", s.name, name)))
}

fn string_field<'v>(s: &'v Struct, name: &str) -> Result<&'v str> {
    field(s, name)?
        .as_str()
        .ok_or_else(|| Error::CorruptEncoding(format!("{}.{} is not a string", s.name, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkConfig;
    use crate::store::MemoryChunkStore;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn value_store() -> ValueStore {
        ValueStore::new(Arc::new(MemoryChunkStore::new()), ChunkConfig::default())
    }

    fn sample(parents: Vec<Ref>) -> Commit {
        Commit {
            value: Ref::of(b"value"),
            parents,
            meta: CommitMeta::new(
                "ada",
                "initial import",
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            ),
            height: 3,
        }
    }

    #[test]
    fn test_commit_round_trip() {
        let vs = value_store();
        let commit = sample(vec![Ref::of(b"p1"), Ref::of(b"p2")]);
        let value = commit.to_value(&vs).unwrap();
        assert_eq!(Commit::from_value(&vs, &value).unwrap(), commit);
    }

    #[test]
    fn test_commit_ref_is_deterministic() {
        let vs = value_store();
        let a = vs.write_value(&sample(vec![Ref::of(b"p")]).to_value(&vs).unwrap()).unwrap();
        let b = vs.write_value(&sample(vec![Ref::of(b"p")]).to_value(&vs).unwrap()).unwrap();
        assert_eq!(a, b);

        let mut other = sample(vec![Ref::of(b"p")]);
        other.meta.message = "different".into();
        let c = vs.write_value(&other.to_value(&vs).unwrap()).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_subsecond_timestamps_survive() {
        let vs = value_store();
        let mut commit = sample(Vec::new());
        commit.meta.timestamp = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let value = commit.to_value(&vs).unwrap();
        assert_eq!(Commit::from_value(&vs, &value).unwrap().meta.timestamp, commit.meta.timestamp);
        assert!(commit.is_root());
    }

    #[test]
    fn test_not_a_commit() {
        let vs = value_store();
        assert!(matches!(
            Commit::from_value(&vs, &Value::from("nope")),
            Err(Error::CorruptEncoding(_))
        ));
        let missing_field = Value::Struct(Struct::new(COMMIT_STRUCT).with("value", Ref::of(b"x")));
        assert!(matches!(
            Commit::from_value(&vs, &missing_field),
            Err(Error::CorruptEncoding(_))
        ));
    }
}
