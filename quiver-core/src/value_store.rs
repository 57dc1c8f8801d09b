//! Reading and writing values.
//!
//! A [`ValueStore`] pairs a chunk store with the chunking configuration and
//! decides how collections are represented: a collection whose items chunk
//! into a single leaf of at most `inline_threshold` encoded bytes is embedded
//! in its parent, anything bigger becomes a prolly tree and the parent keeps
//! only the root ref.

use std::sync::Arc;

use tracing::trace;

use crate::chunker::fits_single_leaf;
use crate::codec;
use crate::config::ChunkConfig;
use crate::cursor::SequenceCursor;
use crate::error::Result;
use crate::hash::Ref;
use crate::node::{Item, Node};
use crate::store::ChunkStore;
use crate::tree::ProllyTree;
use crate::value::{Kind, Sequence, Value};

#[derive(Clone)]
pub struct ValueStore {
    chunks: Arc<dyn ChunkStore>,
    config: ChunkConfig,
}

impl ValueStore {
    pub fn new(chunks: Arc<dyn ChunkStore>, config: ChunkConfig) -> Self {
        ValueStore { chunks, config }
    }

    pub fn chunks(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// A tree handle over the same store and configuration.
    pub fn tree(&self) -> ProllyTree {
        ProllyTree::new(self.chunks.clone(), self.config.clone())
    }

    pub fn write_value(&self, value: &Value) -> Result<Ref> {
        let bytes = codec::encode_chunk(value)?;
        let hash = self.chunks.put(&bytes)?;
        trace!(hash = %hash.short(), kind = %value.kind(), size = bytes.len(), "wrote value");
        Ok(hash)
    }

    /// Read a value. A missing chunk is `NotFound`.
    pub fn read_value(&self, hash: &Ref) -> Result<Value> {
        let chunk = self.chunks.get_required(hash)?;
        codec::decode_chunk(chunk.data())
    }

    /// Read a value that must be of kind `expected`.
    pub fn read_value_as(&self, hash: &Ref, expected: Kind) -> Result<Value> {
        let chunk = self.chunks.get_required(hash)?;
        codec::decode_chunk_as(chunk.data(), expected)
    }

    /// Represent `items` (already in sequence order) as a sequence.
    pub fn sequence_from_items(&self, items: Vec<Item>, keyed: bool) -> Result<Sequence> {
        if fits_single_leaf(&self.config, &items) {
            let mut leaf = Node::new_leaf();
            for item in items.iter().cloned() {
                leaf.push(item, keyed);
            }
            if codec::encoded_node_len(&leaf)? <= self.config.inline_threshold {
                return Ok(Sequence::Inline(leaf));
            }
        }
        let count = items.len() as u64;
        let root = self.tree().build(keyed, items)?;
        Ok(Sequence::Chunked { root, count })
    }

    /// Represent the tree at `root` as a sequence, inlining it if it is small.
    pub fn sequence_from_root(&self, root: Ref) -> Result<Sequence> {
        let node = Node::load(self.chunks.as_ref(), &root)?;
        if node.is_leaf() && codec::encoded_node_len(&node)? <= self.config.inline_threshold {
            return Ok(Sequence::Inline(node));
        }
        Ok(Sequence::Chunked {
            root,
            count: node.total_count(),
        })
    }

    /// Root node of a sequence, and its ref if it is stored.
    pub fn sequence_root(&self, sequence: &Sequence) -> Result<(Arc<Node>, Option<Ref>)> {
        match sequence {
            Sequence::Inline(node) => Ok((Arc::new(node.clone()), None)),
            Sequence::Chunked { root, .. } => Ok((
                Arc::new(Node::load(self.chunks.as_ref(), root)?),
                Some(*root),
            )),
        }
    }

    /// Leaf cursor at the first item of a sequence.
    pub fn cursor(&self, sequence: &Sequence) -> Result<SequenceCursor<'_>> {
        let (node, hash) = self.sequence_root(sequence)?;
        SequenceCursor::at_start(self.chunks.as_ref(), node, hash, 0)
    }

    /// Leaf cursor at the first item with key `>= key`.
    pub fn cursor_at_key(&self, sequence: &Sequence, key: &[u8]) -> Result<SequenceCursor<'_>> {
        let (node, hash) = self.sequence_root(sequence)?;
        SequenceCursor::at_key(self.chunks.as_ref(), node, hash, key)
    }

    /// Leaf cursor at item `index`.
    pub fn cursor_at_index(&self, sequence: &Sequence, index: u64) -> Result<SequenceCursor<'_>> {
        let (node, hash) = self.sequence_root(sequence)?;
        SequenceCursor::at_index(self.chunks.as_ref(), node, hash, index)
    }
}
