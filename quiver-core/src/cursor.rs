//! Cursors over prolly tree sequences.
//!
//! A [`SequenceCursor`] is a stack of frames from the root down to one level
//! of the tree, each frame holding a node and the index of the current entry
//! in it. A cursor at level 0 walks items; a cursor at a higher level walks
//! the parent tuples of that level (used when rebuilding a level during an
//! edit).
//!
//! The path of indices is exposed as an opaque [`Position`] so iteration and
//! diffs can be resumed later without re-reading consumed chunks. The position
//! one past the last entry is the path to the last node with the last index set
//! to that node's length.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::node::{Item, Node};
use crate::store::ChunkStore;

/// Resumable position inside a sequence at a fixed level.
///
/// Positions at the same level of the same tree compare in sequence order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(pub(crate) Vec<usize>);

impl Position {
    /// Depth of the cursor this position belongs to.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Position of the parent tuple, for a position at the start of a node.
    pub(crate) fn parent_of_node_start(&self) -> Position {
        Position(self.0[..self.0.len() - 1].to_vec())
    }

    /// Past-the-end position one level up, for a past-the-end position.
    pub(crate) fn parent_of_end(&self) -> Position {
        let mut parent = self.0[..self.0.len() - 1].to_vec();
        if let Some(last) = parent.last_mut() {
            *last += 1;
        }
        Position(parent)
    }
}

#[derive(Clone)]
struct Frame {
    node: Arc<Node>,
    /// None for an inline root that was never stored
    hash: Option<Ref>,
    idx: usize,
}

/// A cursor for walking one level of a sequence in order.
#[derive(Clone)]
pub struct SequenceCursor<'a> {
    store: &'a dyn ChunkStore,
    stack: Vec<Frame>,
    nodes_read: usize,
}

impl<'a> SequenceCursor<'a> {
    fn with_root(store: &'a dyn ChunkStore, root: Arc<Node>, hash: Option<Ref>, idx: usize) -> Self {
        SequenceCursor {
            store,
            stack: vec![Frame {
                node: root,
                hash,
                idx,
            }],
            nodes_read: 0,
        }
    }

    /// Cursor at the first entry of `level`.
    pub fn at_start(
        store: &'a dyn ChunkStore,
        root: Arc<Node>,
        hash: Option<Ref>,
        level: u8,
    ) -> Result<Self> {
        let depth = depth_for(&root, level)?;
        let mut cursor = SequenceCursor::with_root(store, root, hash, 0);
        cursor.descend_first(depth)?;
        Ok(cursor)
    }

    /// Leaf cursor at the first item whose key is `>= key`.
    pub fn at_key(
        store: &'a dyn ChunkStore,
        root: Arc<Node>,
        hash: Option<Ref>,
        key: &[u8],
    ) -> Result<Self> {
        let mut cursor = SequenceCursor::with_root(store, root, hash, 0);
        loop {
            let top = cursor.top_mut();
            let found = top.node.keys.partition_point(|k| k.as_slice() < key);
            if top.node.is_leaf() {
                top.idx = found;
                return Ok(cursor);
            }
            // Past the last child's last key: stay in the last child.
            top.idx = found.min(top.node.len() - 1);
            let child = cursor.child_frame()?;
            cursor.stack.push(child);
        }
    }

    /// Leaf cursor at item `index`. `index == len` gives the end position.
    pub fn at_index(
        store: &'a dyn ChunkStore,
        root: Arc<Node>,
        hash: Option<Ref>,
        index: u64,
    ) -> Result<Self> {
        let mut cursor = SequenceCursor::with_root(store, root, hash, 0);
        let mut remaining = index;
        loop {
            let top = cursor.top_mut();
            if top.node.is_leaf() {
                top.idx = (remaining as usize).min(top.node.len());
                return Ok(cursor);
            }
            let mut i = 0;
            while i + 1 < top.node.len() && remaining >= top.node.counts[i] {
                remaining -= top.node.counts[i];
                i += 1;
            }
            top.idx = i;
            let child = cursor.child_frame()?;
            cursor.stack.push(child);
        }
    }

    /// Leaf cursor at a position taken from a leaf cursor or iterator of the
    /// same tree. Positions of any other depth are rejected.
    pub fn at_item_position(
        store: &'a dyn ChunkStore,
        root: Arc<Node>,
        hash: Option<Ref>,
        position: &Position,
    ) -> Result<Self> {
        if position.depth() != depth_for(&root, 0)? {
            return Err(invalid_position(position));
        }
        SequenceCursor::at_position(store, root, hash, position)
    }

    /// Cursor at a position previously returned by [`SequenceCursor::position`].
    pub fn at_position(
        store: &'a dyn ChunkStore,
        root: Arc<Node>,
        hash: Option<Ref>,
        position: &Position,
    ) -> Result<Self> {
        let path = &position.0;
        if path.is_empty() || path.len() > root.level as usize + 1 {
            return Err(invalid_position(position));
        }
        let mut cursor = SequenceCursor::with_root(store, root, hash, path[0]);
        for &idx in &path[1..] {
            if cursor.top().idx >= cursor.top().node.len() {
                return Err(invalid_position(position));
            }
            let mut child = cursor.child_frame()?;
            child.idx = idx;
            cursor.stack.push(child);
        }
        if cursor.top().idx > cursor.top().node.len() {
            return Err(invalid_position(position));
        }
        Ok(cursor)
    }

    fn top(&self) -> &Frame {
        &self.stack[self.stack.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    /// Load the child under the top frame's current entry.
    fn child_frame(&mut self) -> Result<Frame> {
        let top = self.top();
        let hash = top.node.child_ref(top.idx)?;
        let node = Node::load(self.store, &hash)?;
        if node.level + 1 != top.node.level {
            return Err(Error::CorruptEncoding(format!(
                "node {} is at level {} under a level {} node",
                hash.short(),
                node.level,
                top.node.level
            )));
        }
        self.nodes_read += 1;
        Ok(Frame {
            node: Arc::new(node),
            hash: Some(hash),
            idx: 0,
        })
    }

    fn descend_first(&mut self, depth: usize) -> Result<()> {
        while self.stack.len() < depth {
            let child = self.child_frame()?;
            self.stack.push(child);
        }
        Ok(())
    }

    pub fn position(&self) -> Position {
        Position(self.stack.iter().map(|f| f.idx).collect())
    }

    /// Level of the entries this cursor walks.
    pub fn level(&self) -> u8 {
        self.top().node.level
    }

    /// False once the cursor has moved past the last entry.
    pub fn valid(&self) -> bool {
        let top = self.top();
        top.idx < top.node.len()
    }

    pub fn at_node_start(&self) -> bool {
        self.top().idx == 0
    }

    pub fn current_key(&self) -> Option<&[u8]> {
        let top = self.top();
        (top.idx < top.node.len()).then(|| top.node.key(top.idx))
    }

    pub fn current_value(&self) -> Option<&[u8]> {
        let top = self.top();
        (top.idx < top.node.len()).then(|| top.node.value(top.idx))
    }

    pub fn current_item(&self) -> Option<Item> {
        let top = self.top();
        (top.idx < top.node.len()).then(|| top.node.item(top.idx))
    }

    /// Index of the current entry counted in leaf items from the start.
    pub fn index(&self) -> u64 {
        self.stack
            .iter()
            .map(|frame| {
                if frame.node.is_leaf() {
                    frame.idx as u64
                } else {
                    frame.node.counts[..frame.idx.min(frame.node.len())].iter().sum()
                }
            })
            .sum()
    }

    /// Number of nodes loaded from the store so far.
    pub fn nodes_read(&self) -> usize {
        self.nodes_read
    }

    /// Move back to the first entry of the current node.
    pub fn seek_node_start(&mut self) {
        self.top_mut().idx = 0;
    }

    /// Move to the next entry, crossing into the next node when needed.
    /// Advancing at the end is a no-op.
    pub fn advance(&mut self) -> Result<()> {
        let depth = self.stack.len();
        let top = self.top_mut();
        if top.idx < top.node.len() {
            top.idx += 1;
        }
        if top.idx < top.node.len() {
            return Ok(());
        }
        self.next_node(depth)
    }

    /// Refs of the stored nodes that start exactly at the cursor, smallest
    /// first: entry `j` is the node `j` levels above the cursor's own node.
    /// `None` marks an inline root.
    pub fn subtrees_starting_here(&self) -> Vec<Option<Ref>> {
        let mut refs = Vec::new();
        if !self.valid() {
            return refs;
        }
        for frame in self.stack.iter().rev() {
            if frame.idx != 0 {
                break;
            }
            refs.push(frame.hash);
        }
        refs
    }

    /// Skip the whole node `levels_up` levels above the cursor's node
    /// (0 = the cursor's own node), landing on the first entry after it.
    pub fn skip_subtree(&mut self, levels_up: usize) -> Result<()> {
        let depth = self.stack.len();
        let keep = depth - levels_up;
        self.stack.truncate(keep);
        let top = self.top_mut();
        top.idx = top.node.len();
        self.next_node(depth)
    }

    /// The bottom frame is exhausted: move to the start of the following node
    /// at the same depth, or park at the end position.
    fn next_node(&mut self, depth: usize) -> Result<()> {
        let mut j = self.stack.len() - 1;
        loop {
            if j == 0 {
                return self.park_at_end(depth);
            }
            j -= 1;
            let frame = &self.stack[j];
            if frame.idx + 1 < frame.node.len() {
                break;
            }
        }
        self.stack[j].idx += 1;
        self.stack.truncate(j + 1);
        self.descend_first(depth)
    }

    fn park_at_end(&mut self, depth: usize) -> Result<()> {
        while self.stack.len() < depth {
            let top = self.top_mut();
            top.idx = top.node.len().saturating_sub(1);
            let child = self.child_frame()?;
            self.stack.push(child);
        }
        let top = self.top_mut();
        top.idx = top.node.len();
        Ok(())
    }
}

fn depth_for(root: &Node, level: u8) -> Result<usize> {
    if level > root.level {
        return Err(Error::InvalidEdit(format!(
            "level {} above root level {}",
            level, root.level
        )));
    }
    Ok((root.level - level) as usize + 1)
}

fn invalid_position(position: &Position) -> Error {
    Error::InvalidEdit(format!("position {:?} does not exist in this sequence", position.0))
}

/// Lazy iterator over the items of a sequence, optionally bounded above.
///
/// Read errors are yielded once, after which the iterator is exhausted.
pub struct SequenceIter<'a> {
    cursor: SequenceCursor<'a>,
    end_key: Option<Vec<u8>>,
    failed: bool,
}

impl<'a> SequenceIter<'a> {
    pub fn new(cursor: SequenceCursor<'a>, end_key: Option<Vec<u8>>) -> Self {
        SequenceIter {
            cursor,
            end_key,
            failed: false,
        }
    }

    /// Position of the next item to be yielded; pass it back to resume.
    pub fn position(&self) -> Position {
        self.cursor.position()
    }

    pub fn nodes_read(&self) -> usize {
        self.cursor.nodes_read()
    }
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = Result<Item>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.cursor.current_item()?;
        if let Some(end) = &self.end_key {
            if item.key.as_slice() >= end.as_slice() {
                return None;
            }
        }
        if let Err(err) = self.cursor.advance() {
            self.failed = true;
            return Some(Err(err));
        }
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::parent_item;
    use crate::store::MemoryChunkStore;

    fn leaf(keys: &[&str]) -> Node {
        let mut node = Node::new_leaf();
        for k in keys {
            node.push(
                Item::leaf(k.as_bytes().to_vec(), format!("val_{}", k).into_bytes()),
                true,
            );
        }
        node
    }

    /// Two-level tree: [a b] [d e] [g h i]
    fn two_level(store: &MemoryChunkStore) -> (Arc<Node>, Ref) {
        let mut root = Node::new(1);
        for keys in [&["a", "b"][..], &["d", "e"][..], &["g", "h", "i"][..]] {
            let child = leaf(keys);
            let hash = child.save(store).unwrap();
            root.push(parent_item(&child, hash, true), true);
        }
        let hash = root.save(store).unwrap();
        (Arc::new(root), hash)
    }

    fn collect_keys(cursor: &mut SequenceCursor) -> Vec<String> {
        let mut keys = Vec::new();
        while let Some(k) = cursor.current_key() {
            keys.push(String::from_utf8(k.to_vec()).unwrap());
            cursor.advance().unwrap();
        }
        keys
    }

    #[test]
    fn test_cursor_single_leaf() {
        let store = MemoryChunkStore::new();
        let root = Arc::new(leaf(&["a", "b"]));
        let mut cursor = SequenceCursor::at_start(&store, root, None, 0).unwrap();
        assert_eq!(cursor.current_value(), Some(&b"val_a"[..]));
        assert_eq!(collect_keys(&mut cursor), vec!["a", "b"]);
        assert!(!cursor.valid());
        // Advancing at the end stays at the end.
        cursor.advance().unwrap();
        assert_eq!(cursor.position(), Position(vec![2]));
    }

    #[test]
    fn test_cursor_crosses_nodes() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let mut cursor = SequenceCursor::at_start(&store, root, Some(hash), 0).unwrap();
        assert_eq!(
            collect_keys(&mut cursor),
            vec!["a", "b", "d", "e", "g", "h", "i"]
        );
        assert_eq!(cursor.position(), Position(vec![2, 3]));
    }

    #[test]
    fn test_cursor_seek_key() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);

        let cursor = SequenceCursor::at_key(&store, root.clone(), Some(hash), b"c").unwrap();
        assert_eq!(cursor.current_key(), Some(&b"d"[..]));
        assert_eq!(cursor.index(), 2);

        let cursor = SequenceCursor::at_key(&store, root.clone(), Some(hash), b"h").unwrap();
        assert_eq!(cursor.current_key(), Some(&b"h"[..]));

        let cursor = SequenceCursor::at_key(&store, root, Some(hash), b"z").unwrap();
        assert!(!cursor.valid());
        assert_eq!(cursor.position(), Position(vec![2, 3]));
    }

    #[test]
    fn test_cursor_seek_index() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        for (index, key) in [(0u64, "a"), (2, "d"), (4, "g"), (6, "i")] {
            let cursor = SequenceCursor::at_index(&store, root.clone(), Some(hash), index).unwrap();
            assert_eq!(cursor.current_key(), Some(key.as_bytes()));
            assert_eq!(cursor.index(), index);
        }
        let end = SequenceCursor::at_index(&store, root, Some(hash), 7).unwrap();
        assert!(!end.valid());
    }

    #[test]
    fn test_cursor_resume_from_position() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let mut cursor = SequenceCursor::at_start(&store, root.clone(), Some(hash), 0).unwrap();
        for _ in 0..3 {
            cursor.advance().unwrap();
        }
        let position = cursor.position();
        let mut resumed = SequenceCursor::at_position(&store, root.clone(), Some(hash), &position).unwrap();
        assert_eq!(collect_keys(&mut resumed), vec!["e", "g", "h", "i"]);

        assert!(SequenceCursor::at_position(&store, root.clone(), Some(hash), &Position(vec![9, 0])).is_err());

        // Item-level resumes need the full path down to a leaf.
        let resumed = SequenceCursor::at_item_position(&store, root.clone(), Some(hash), &position).unwrap();
        assert_eq!(resumed.current_key(), Some(&b"e"[..]));
        assert!(matches!(
            SequenceCursor::at_item_position(&store, root, Some(hash), &Position(vec![1])),
            Err(Error::InvalidEdit(_))
        ));
    }

    #[test]
    fn test_cursor_meta_level() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let mut cursor = SequenceCursor::at_start(&store, root, Some(hash), 1).unwrap();
        assert_eq!(cursor.level(), 1);
        assert_eq!(collect_keys(&mut cursor), vec!["b", "e", "i"]);
    }

    #[test]
    fn test_subtrees_and_skip() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let mut cursor = SequenceCursor::at_start(&store, root, Some(hash), 0).unwrap();

        let starting = cursor.subtrees_starting_here();
        assert_eq!(starting.len(), 2);
        assert_eq!(starting[1], Some(hash));

        cursor.skip_subtree(0).unwrap();
        assert_eq!(cursor.current_key(), Some(&b"d"[..]));
        assert_eq!(cursor.subtrees_starting_here().len(), 1);

        cursor.advance().unwrap();
        assert!(cursor.subtrees_starting_here().is_empty());

        cursor.advance().unwrap();
        cursor.skip_subtree(0).unwrap();
        assert!(!cursor.valid());
        assert_eq!(cursor.position(), Position(vec![2, 3]));
    }

    #[test]
    fn test_skip_whole_tree_parks_at_end() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let mut cursor = SequenceCursor::at_start(&store, root, Some(hash), 0).unwrap();
        cursor.skip_subtree(1).unwrap();
        assert!(!cursor.valid());
        assert_eq!(cursor.position(), Position(vec![2, 3]));
    }

    #[test]
    fn test_sequence_iter_bounds() {
        let store = MemoryChunkStore::new();
        let (root, hash) = two_level(&store);
        let cursor = SequenceCursor::at_key(&store, root, Some(hash), b"b").unwrap();
        let keys: Vec<Vec<u8>> = SequenceIter::new(cursor, Some(b"h".to_vec()))
            .map(|item| item.unwrap().key)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"d".to_vec(), b"e".to_vec(), b"g".to_vec()]);
    }

    #[test]
    fn test_position_parents() {
        assert_eq!(Position(vec![1, 0]).parent_of_node_start(), Position(vec![1]));
        assert_eq!(Position(vec![2, 3]).parent_of_end(), Position(vec![3]));
    }
}
