//! Prolly tree nodes.
//!
//! A node is either a leaf (level 0) holding a run of items, or a meta node
//! (level > 0) holding one tuple per child: the child's ref, the number of
//! items in the child's subtree and the child's last key.
//!
//! ## Keyed and indexed sequences
//!
//! Maps and sets are keyed: every leaf item has a key, and `keys[i]` of a meta
//! node is the LAST key of child `i`, so the child to descend into for a target
//! key is the first child whose last key is `>= target`:
//!
//! ```text
//! meta keys = ["d", "h", "m"]
//! child 0: keys <= "d"
//! child 1: "d" < keys <= "h"
//! child 2: "h" < keys <= "m"
//! ```
//!
//! Lists are indexed: `keys` is empty at every level and positional lookup
//! walks `counts` instead.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::store::ChunkStore;

/// One entry of a node at any level.
///
/// At level 0 `value` is the item's payload and `count` is 1. Above that
/// `value` holds the child ref bytes and `count` the child's subtree size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub count: u64,
}

impl Item {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Item {
        Item {
            key,
            value,
            count: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub level: u8,
    /// Item keys (leaf) or child last keys (meta); empty for indexed sequences
    pub keys: Vec<Vec<u8>>,
    /// Item values (leaf) or child refs (meta)
    pub values: Vec<Vec<u8>>,
    /// Subtree item counts, meta nodes only
    pub counts: Vec<u64>,
}

impl Node {
    pub fn new_leaf() -> Self {
        Node::new(0)
    }

    pub fn new(level: u8) -> Self {
        Node {
            level,
            keys: Vec::new(),
            values: Vec::new(),
            counts: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_keyed(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Key of entry `i`; empty for indexed sequences.
    pub fn key(&self, i: usize) -> &[u8] {
        self.keys.get(i).map(|k| k.as_slice()).unwrap_or(&[])
    }

    pub fn value(&self, i: usize) -> &[u8] {
        &self.values[i]
    }

    /// Number of leaf items under entry `i`.
    pub fn count(&self, i: usize) -> u64 {
        if self.is_leaf() {
            1
        } else {
            self.counts[i]
        }
    }

    /// Number of leaf items under this node.
    pub fn total_count(&self) -> u64 {
        if self.is_leaf() {
            self.values.len() as u64
        } else {
            self.counts.iter().sum()
        }
    }

    pub fn last_key(&self) -> &[u8] {
        self.keys.last().map(|k| k.as_slice()).unwrap_or(&[])
    }

    pub fn child_ref(&self, i: usize) -> Result<Ref> {
        Ref::from_slice(&self.values[i])
    }

    pub fn item(&self, i: usize) -> Item {
        Item {
            key: self.key(i).to_vec(),
            value: self.values[i].clone(),
            count: self.count(i),
        }
    }

    /// Append an entry. `keyed` decides whether the key is kept.
    pub fn push(&mut self, item: Item, keyed: bool) {
        if keyed {
            self.keys.push(item.key);
        }
        self.values.push(item.value);
        if !self.is_leaf() {
            self.counts.push(item.count);
        }
    }

    /// Check the layout every decoded node must have before its entries are
    /// indexed: parallel vectors of equal length, counts only on meta nodes,
    /// and at least one 20-byte child ref per meta node.
    pub fn check_shape(&self) -> Result<()> {
        let len = self.values.len();
        if !self.keys.is_empty() && self.keys.len() != len {
            return Err(Error::CorruptEncoding(format!(
                "node has {} keys for {} entries",
                self.keys.len(),
                len
            )));
        }
        if self.is_leaf() {
            if !self.counts.is_empty() {
                return Err(Error::CorruptEncoding("leaf node carries subtree counts".into()));
            }
            return Ok(());
        }
        if len == 0 {
            return Err(Error::CorruptEncoding(format!("empty meta node at level {}", self.level)));
        }
        if self.counts.len() != len {
            return Err(Error::CorruptEncoding(format!(
                "meta node has {} counts for {} children",
                self.counts.len(),
                len
            )));
        }
        if let Some(bad) = self.values.iter().find(|v| v.len() != Ref::LEN) {
            return Err(Error::CorruptEncoding(format!(
                "meta node child ref of {} bytes",
                bad.len()
            )));
        }
        Ok(())
    }

    /// Read and decode a node chunk.
    pub fn load(store: &dyn ChunkStore, hash: &Ref) -> Result<Node> {
        let chunk = store.get_required(hash)?;
        codec::decode_node(chunk.data())
    }

    /// Encode and write this node, returning its ref.
    pub fn save(&self, store: &dyn ChunkStore) -> Result<Ref> {
        let bytes = codec::encode_node(self)?;
        store.put(&bytes)
    }

    /// Validate this node and its entire subtree.
    ///
    /// Checks entry ordering, that meta keys are the last keys of their
    /// children, that meta counts match subtree sizes and that levels decrease
    /// by one per step.
    pub fn validate(&self, store: &dyn ChunkStore, context: &str) -> std::result::Result<(), String> {
        let context_str = if context.is_empty() {
            String::new()
        } else {
            format!(" ({})", context)
        };
        self.validate_subtree(store, &context_str).map(|_| ())
    }

    fn validate_subtree(
        &self,
        store: &dyn ChunkStore,
        context_str: &str,
    ) -> std::result::Result<Summary, String> {
        if !self.keys.is_empty() && self.keys.len() != self.values.len() {
            return Err(format!(
                "Node has {} keys but {} values{}",
                self.keys.len(),
                self.values.len(),
                context_str
            ));
        }

        for i in 1..self.keys.len() {
            if self.keys[i] <= self.keys[i - 1] {
                return Err(format!(
                    "Keys out of order at position {}: {:?} >= {:?}{}",
                    i,
                    self.keys[i - 1],
                    self.keys[i],
                    context_str
                ));
            }
        }

        if self.is_leaf() {
            if !self.counts.is_empty() {
                return Err(format!("Leaf node carries counts{}", context_str));
            }
            return Ok(Summary {
                count: self.values.len() as u64,
                first_key: self.keys.first().cloned(),
                last_key: self.keys.last().cloned(),
            });
        }

        if self.values.is_empty() {
            return Err(format!("Meta node at level {} is empty{}", self.level, context_str));
        }
        if self.counts.len() != self.values.len() {
            return Err(format!(
                "Meta node has {} counts but {} children{}",
                self.counts.len(),
                self.values.len(),
                context_str
            ));
        }

        let mut total = 0;
        let mut first_key = None;
        let mut prev_last: Option<Vec<u8>> = None;
        for i in 0..self.values.len() {
            let child_ref = self.child_ref(i).map_err(|e| e.to_string())?;
            let child = Node::load(store, &child_ref)
                .map_err(|e| format!("Child {} unreadable: {}{}", i, e, context_str))?;
            if child.level + 1 != self.level {
                return Err(format!(
                    "Child {} is at level {} under a level {} node{}",
                    i, child.level, self.level, context_str
                ));
            }

            let summary = child.validate_subtree(store, context_str)?;
            if summary.count != self.counts[i] {
                return Err(format!(
                    "Count mismatch at child {}: recorded {}, actual {}{}",
                    i, self.counts[i], summary.count, context_str
                ));
            }
            if self.is_keyed() {
                if summary.last_key.as_deref() != Some(self.key(i)) {
                    return Err(format!(
                        "Key invariant violated at child {}: recorded {:?}, actual {:?}{}",
                        i,
                        self.key(i),
                        summary.last_key,
                        context_str
                    ));
                }
                if let (Some(prev), Some(first)) = (&prev_last, &summary.first_key) {
                    if first <= prev {
                        return Err(format!(
                            "Child {} starts at {:?}, not after {:?}{}",
                            i, first, prev, context_str
                        ));
                    }
                }
                prev_last = summary.last_key.clone();
            }
            if i == 0 {
                first_key = summary.first_key;
            }
            total += summary.count;
        }

        Ok(Summary {
            count: total,
            first_key,
            last_key: self.keys.last().cloned(),
        })
    }
}

struct Summary {
    count: u64,
    first_key: Option<Vec<u8>>,
    last_key: Option<Vec<u8>>,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_leaf() {
            write!(f, "Leaf({} items)", self.len())
        } else {
            write!(
                f,
                "Meta(level={}, children={}, items={})",
                self.level,
                self.len(),
                self.total_count()
            )
        }
    }
}
