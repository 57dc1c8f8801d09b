//! Canonical chunk encoding.
//!
//! Every chunk starts with a two byte header:
//!
//! ```text
//! +---------+------+------------------+
//! | version | kind | bincode payload  |
//! +---------+------+------------------+
//! ```
//!
//! `version` identifies the encoding format so future formats can coexist
//! with stored history. `kind` says whether the payload is a [`Value`] or a
//! prolly tree [`Node`]. Payloads use fixed-width little-endian bincode, which
//! is deterministic: struct fields are `BTreeMap`-ordered, numbers are
//! canonicalised by [`crate::value::Number`] and collections pick their
//! representation from content alone.
//!
//! Items stored inside sequence leaves (map keys, map values, list elements,
//! set members) are encoded values *without* a header; the enclosing chunk's
//! header covers them.

use bincode::Options;
use tracing::warn;

use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::node::Node;
use crate::value::{Kind, Sequence, Value};

pub const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkKind {
    Value = 1,
    SequenceNode = 2,
}

impl ChunkKind {
    fn from_byte(byte: u8) -> Option<ChunkKind> {
        match byte {
            1 => Some(ChunkKind::Value),
            2 => Some(ChunkKind::SequenceNode),
            _ => None,
        }
    }

    /// Kind of a chunk if it carries a header of the current format.
    pub fn peek(data: &[u8]) -> Option<ChunkKind> {
        match data {
            [FORMAT_VERSION, kind, ..] => ChunkKind::from_byte(*kind),
            _ => None,
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

fn frame(kind: ChunkKind, payload: Vec<u8>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.push(FORMAT_VERSION);
    bytes.push(kind as u8);
    bytes.extend_from_slice(&payload);
    bytes
}

fn unframe(data: &[u8], expected: ChunkKind) -> Result<&[u8]> {
    let (version, kind) = match data {
        [version, kind, ..] => (*version, *kind),
        _ => {
            return Err(Error::CorruptEncoding(format!(
                "chunk of {} bytes has no header",
                data.len()
            )))
        }
    };
    if version != FORMAT_VERSION {
        return Err(Error::CorruptEncoding(format!(
            "unsupported format version {}",
            version
        )));
    }
    match ChunkKind::from_byte(kind) {
        Some(found) if found == expected => Ok(&data[HEADER_LEN..]),
        Some(found) => Err(Error::CorruptEncoding(format!(
            "expected a {:?} chunk, found {:?}",
            expected, found
        ))),
        None => Err(Error::CorruptEncoding(format!("unknown chunk kind {}", kind))),
    }
}

/// Encode a value as a stand-alone chunk.
pub fn encode_chunk(value: &Value) -> Result<Vec<u8>> {
    Ok(frame(ChunkKind::Value, options().serialize(value)?))
}

pub fn decode_chunk(data: &[u8]) -> Result<Value> {
    let payload = unframe(data, ChunkKind::Value)?;
    let value = options().deserialize(payload)?;
    check_inline_shapes(&value)?;
    Ok(value)
}

/// Decode a value chunk, failing with `TypeMismatch` if it is not of `expected` kind.
pub fn decode_chunk_as(data: &[u8], expected: Kind) -> Result<Value> {
    let value = decode_chunk(data)?;
    if value.kind() != expected {
        return Err(Error::TypeMismatch {
            expected,
            found: value.kind(),
        });
    }
    Ok(value)
}

pub fn encode_node(node: &Node) -> Result<Vec<u8>> {
    Ok(frame(ChunkKind::SequenceNode, options().serialize(node)?))
}

pub fn decode_node(data: &[u8]) -> Result<Node> {
    let payload = unframe(data, ChunkKind::SequenceNode)?;
    let node: Node = options().deserialize(payload)?;
    node.check_shape()?;
    Ok(node)
}

/// Encode a value for storage as an item inside a sequence leaf.
pub fn encode_item(value: &Value) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

pub fn decode_item(bytes: &[u8]) -> Result<Value> {
    let value = options().deserialize(bytes)?;
    check_inline_shapes(&value)?;
    Ok(value)
}

/// Inline collections must hold a well-formed leaf. Nested items are checked
/// when they are decoded in turn.
fn check_inline_shapes(value: &Value) -> Result<()> {
    let sequence = match value {
        Value::List(list) => list.sequence(),
        Value::Map(map) => map.sequence(),
        Value::Set(set) => set.sequence(),
        Value::Struct(s) => return s.fields.values().try_for_each(check_inline_shapes),
        _ => return Ok(()),
    };
    if let Sequence::Inline(node) = sequence {
        if !node.is_leaf() {
            return Err(Error::CorruptEncoding(format!(
                "inline sequence node at level {}",
                node.level
            )));
        }
        node.check_shape()?;
    }
    Ok(())
}

/// Size of a node once encoded, without allocating the encoding.
pub fn encoded_node_len(node: &Node) -> Result<usize> {
    Ok(HEADER_LEN + options().serialized_size(node)? as usize)
}

/// Collect every ref directly embedded in `value`.
///
/// Inline collections are searched recursively; chunked ones contribute their
/// root ref only.
pub fn value_refs(value: &Value, out: &mut Vec<Ref>) -> Result<()> {
    match value {
        Value::Ref(r) => out.push(*r),
        Value::List(list) => sequence_refs(list.sequence(), out)?,
        Value::Map(map) => sequence_refs(map.sequence(), out)?,
        Value::Set(set) => sequence_refs(set.sequence(), out)?,
        Value::Struct(s) => {
            for field in s.fields.values() {
                value_refs(field, out)?;
            }
        }
        Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Bytes(_) => {}
    }
    Ok(())
}

fn sequence_refs(sequence: &Sequence, out: &mut Vec<Ref>) -> Result<()> {
    match sequence {
        Sequence::Chunked { root, .. } => out.push(*root),
        Sequence::Inline(node) => leaf_refs(node, out)?,
    }
    Ok(())
}

fn leaf_refs(node: &Node, out: &mut Vec<Ref>) -> Result<()> {
    for bytes in node.keys.iter().chain(node.values.iter()) {
        if bytes.is_empty() {
            continue;
        }
        value_refs(&decode_item(bytes)?, out)?;
    }
    Ok(())
}

/// Every ref embedded in a stored chunk: child nodes of meta nodes, and refs
/// reachable through the values held by value chunks and leaves.
///
/// Leaves written through the raw tree API may hold arbitrary bytes; items that
/// do not decode as values are treated as opaque.
pub fn chunk_refs(data: &[u8]) -> Result<Vec<Ref>> {
    let mut refs = Vec::new();
    match ChunkKind::peek(data) {
        Some(ChunkKind::Value) => value_refs(&decode_chunk(data)?, &mut refs)?,
        Some(ChunkKind::SequenceNode) => {
            let node = decode_node(data)?;
            if node.is_leaf() {
                for bytes in node.keys.iter().chain(node.values.iter()) {
                    if bytes.is_empty() {
                        continue;
                    }
                    if let Ok(value) = decode_item(bytes) {
                        value_refs(&value, &mut refs)?;
                    }
                }
            } else {
                for i in 0..node.len() {
                    refs.push(node.child_ref(i)?);
                }
            }
        }
        None => {
            warn!(len = data.len(), "chunk without a recognised header");
            return Err(Error::CorruptEncoding(
                "chunk without a recognised header".to_string(),
            ));
        }
    }
    Ok(refs)
}
