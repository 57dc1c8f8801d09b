//! Prolly tree construction and editing.
//!
//! Features:
//! - Content-addressed nodes stored through a [`ChunkStore`]
//! - Content-defined node boundaries (see [`crate::chunker`])
//! - Keyed (map/set) and indexed (list) sequences
//! - Batch edits that rewrite only the nodes around each edit
//!
//! ## History independence
//!
//! The shape of a tree is a pure function of its items: `edit(build(xs), ops)`
//! yields the same root as `build(apply(xs, ops))`. Edits are turned into
//! splices at level 0. Each level is then rebuilt only from the start of the
//! first node a splice touches until the fresh chunker closes a node exactly
//! where an old node also started; from there on the old nodes are reused.
//! The changed stretch becomes a splice of the parent level and the process
//! repeats upwards. The root level is always rebuilt whole and, if it no
//! longer fits in one node, new levels are stacked on top. A meta node with a
//! single child is never a root.

use std::sync::Arc;

use tracing::debug;

use crate::chunker::LevelChunker;
use crate::config::ChunkConfig;
use crate::cursor::{Position, SequenceCursor, SequenceIter};
use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::node::{Item, Node};
use crate::store::ChunkStore;

/// Statistics for the operations run since the last reset
#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub nodes_created: usize,
    pub leaves_created: usize,
    pub internals_created: usize,
    pub nodes_read: usize,
    pub items_rechunked: usize,
}

impl BatchStats {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn reset(&mut self) {
        *self = Default::default();
    }

    fn record_level(&mut self, level: u8, written: usize) {
        self.nodes_created += written;
        if level == 0 {
            self.leaves_created += written;
        } else {
            self.internals_created += written;
        }
    }
}

/// A keyed edit. Keys are raw bytes compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Insert, or overwrite if the key exists
    Insert(Vec<u8>, Vec<u8>),
    /// Replace the value of an existing key
    Update(Vec<u8>, Vec<u8>),
    /// Remove an existing key
    Delete(Vec<u8>),
}

impl Edit {
    pub fn key(&self) -> &[u8] {
        match self {
            Edit::Insert(k, _) | Edit::Update(k, _) | Edit::Delete(k) => k,
        }
    }
}

/// A positional edit: remove `remove` items at `index`, then insert `insert` there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListSplice {
    pub index: u64,
    pub remove: u64,
    pub insert: Vec<Vec<u8>>,
}

/// Sort edits by key, keeping only the last edit of each key.
pub(crate) fn normalize_edits(mut edits: Vec<Edit>) -> Vec<Edit> {
    // sort_by is stable, so later edits stay later within a key
    edits.sort_by(|a, b| a.key().cmp(b.key()));
    let mut deduped: Vec<Edit> = Vec::with_capacity(edits.len());
    for edit in edits {
        match deduped.last_mut() {
            Some(last) if last.key() == edit.key() => *last = edit,
            _ => deduped.push(edit),
        }
    }
    deduped
}

/// Splices must lie within `len`, be ordered by index and not overlap.
pub(crate) fn check_splices(splices: &[ListSplice], len: u64) -> Result<()> {
    let mut floor = 0u64;
    for splice in splices {
        let end_index = splice.index.saturating_add(splice.remove);
        if splice.index > len || end_index > len {
            return Err(Error::IndexOutOfRange {
                index: end_index.max(splice.index),
                len,
            });
        }
        if splice.index < floor {
            return Err(Error::InvalidEdit(format!(
                "splice at {} overlaps or precedes the previous splice",
                splice.index
            )));
        }
        floor = end_index;
    }
    Ok(())
}

/// Replacement of the entries in `[start, end)` of one level.
#[derive(Debug, Clone)]
struct LevelSplice {
    start: Position,
    end: Position,
    items: Vec<Item>,
}

enum LevelOutcome {
    Parent(Vec<LevelSplice>),
    Root(Vec<Item>),
}

/// Builds, reads and edits prolly trees in a chunk store.
pub struct ProllyTree {
    store: Arc<dyn ChunkStore>,
    config: ChunkConfig,
    stats: BatchStats,
}

impl ProllyTree {
    pub fn new(store: Arc<dyn ChunkStore>, config: ChunkConfig) -> Self {
        ProllyTree {
            store,
            config,
            stats: BatchStats::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn load_root(&self, root: &Ref) -> Result<Arc<Node>> {
        Ok(Arc::new(Node::load(self.store.as_ref(), root)?))
    }

    /// Build a tree from items already in sequence order.
    ///
    /// For keyed trees the keys must be strictly increasing.
    pub fn build(&mut self, keyed: bool, items: impl IntoIterator<Item = Item>) -> Result<Ref> {
        let root = self.build_levels(items.into_iter().collect(), 0, keyed)?;
        debug!(root = %root.short(), nodes = self.stats.nodes_created, "built tree");
        Ok(root)
    }

    /// Build a keyed tree from unsorted pairs. Later duplicates win.
    pub fn build_from_pairs(&mut self, mut pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Ref> {
        pairs.reverse();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs.dedup_by(|later, earlier| later.0 == earlier.0);
        self.build(true, pairs.into_iter().map(|(k, v)| Item::leaf(k, v)))
    }

    /// Build an indexed tree.
    pub fn build_list(&mut self, values: Vec<Vec<u8>>) -> Result<Ref> {
        self.build(false, values.into_iter().map(|v| Item::leaf(Vec::new(), v)))
    }

    /// Chunk `items` (entries of `level`) upward until a single root remains.
    fn build_levels(&mut self, mut items: Vec<Item>, mut level: u8, keyed: bool) -> Result<Ref> {
        let store = self.store.clone();
        loop {
            if level > 0 && items.len() == 1 {
                return self.canonical_root(Ref::from_slice(&items[0].value)?);
            }
            let mut chunker = LevelChunker::new(store.as_ref(), &self.config, level, keyed);
            for item in items {
                chunker.push(item)?;
            }
            let (parents, written) = chunker.finish()?;
            self.stats.record_level(level, written);

            match parents.len() {
                0 => return Node::new_leaf().save(store.as_ref()),
                1 => return Ref::from_slice(&parents[0].value),
                _ => {
                    items = parents;
                    level += 1;
                }
            }
        }
    }

    /// Descend through meta nodes that have a single child.
    fn canonical_root(&mut self, mut root: Ref) -> Result<Ref> {
        loop {
            let node = Node::load(self.store.as_ref(), &root)?;
            self.stats.nodes_read += 1;
            if node.is_leaf() || node.len() != 1 {
                return Ok(root);
            }
            root = node.child_ref(0)?;
        }
    }

    /// Number of items in the tree.
    pub fn count(&self, root: &Ref) -> Result<u64> {
        Ok(self.load_root(root)?.total_count())
    }

    pub fn get(&self, root: &Ref, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let node = self.load_root(root)?;
        let cursor = SequenceCursor::at_key(self.store.as_ref(), node, Some(*root), key)?;
        Ok(match cursor.current_key() {
            Some(found) if found == key => cursor.current_value().map(|v| v.to_vec()),
            _ => None,
        })
    }

    pub fn get_index(&self, root: &Ref, index: u64) -> Result<Option<Item>> {
        let node = self.load_root(root)?;
        let cursor = SequenceCursor::at_index(self.store.as_ref(), node, Some(*root), index)?;
        Ok(cursor.current_item())
    }

    /// Lazily iterate items with keys in `[from, to)`.
    pub fn iter(&self, root: &Ref, from: Option<&[u8]>, to: Option<&[u8]>) -> Result<SequenceIter<'_>> {
        let node = self.load_root(root)?;
        let store = self.store.as_ref();
        let cursor = match from {
            Some(key) => SequenceCursor::at_key(store, node, Some(*root), key)?,
            None => SequenceCursor::at_start(store, node, Some(*root), 0)?,
        };
        Ok(SequenceIter::new(cursor, to.map(|k| k.to_vec())))
    }

    /// Resume iteration at a position taken from an earlier iterator.
    pub fn iter_from(&self, root: &Ref, position: &Position) -> Result<SequenceIter<'_>> {
        let node = self.load_root(root)?;
        let cursor = SequenceCursor::at_item_position(self.store.as_ref(), node, Some(*root), position)?;
        Ok(SequenceIter::new(cursor, None))
    }

    /// All items, materialised. Meant for tests and tools.
    pub fn items(&self, root: &Ref) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.iter(root, None, None)?
            .map(|item| item.map(|item| (item.key, item.value)))
            .collect()
    }

    /// Apply a batch of keyed edits.
    ///
    /// Edits may come in any order; for a key edited more than once the last
    /// edit wins. `Update` and `Delete` of a missing key fail with
    /// `KeyNotFound` and leave nothing changed.
    pub fn edit(&mut self, root: &Ref, edits: Vec<Edit>) -> Result<Ref> {
        let node = self.load_root(root)?;
        if !node.is_empty() && !node.is_keyed() {
            return Err(Error::InvalidEdit("keyed edit on an indexed sequence".into()));
        }

        let store = self.store.clone();
        let edits = normalize_edits(edits);
        let mut splices = Vec::with_capacity(edits.len());
        for edit in edits {
            let cursor = SequenceCursor::at_key(store.as_ref(), node.clone(), Some(*root), edit.key())?;
            let exists = cursor.current_key() == Some(edit.key());
            let start = cursor.position();
            let end = if exists {
                let mut next = cursor.clone();
                next.advance()?;
                next.position()
            } else {
                start.clone()
            };
            let items = match edit {
                Edit::Insert(k, v) => vec![Item::leaf(k, v)],
                Edit::Update(k, v) if exists => vec![Item::leaf(k, v)],
                Edit::Delete(_) if exists => Vec::new(),
                Edit::Update(k, _) | Edit::Delete(k) => {
                    return Err(Error::KeyNotFound(hex::encode(k)));
                }
            };
            splices.push(LevelSplice { start, end, items });
        }

        self.apply_splices(*root, node, true, splices)
    }

    /// Apply positional splices to an indexed tree.
    ///
    /// Splices must be ordered by index and must not overlap; indices refer
    /// to the sequence before any of them is applied.
    pub fn splice(&mut self, root: &Ref, splices: Vec<ListSplice>) -> Result<Ref> {
        let node = self.load_root(root)?;
        if node.is_keyed() {
            return Err(Error::InvalidEdit("positional edit on a keyed sequence".into()));
        }
        check_splices(&splices, node.total_count())?;
        let store = self.store.clone();

        let mut level_splices = Vec::with_capacity(splices.len());
        for splice in splices {
            let end_index = splice.index + splice.remove;
            let start = SequenceCursor::at_index(store.as_ref(), node.clone(), Some(*root), splice.index)?;
            let end = if splice.remove == 0 {
                start.position()
            } else {
                SequenceCursor::at_index(store.as_ref(), node.clone(), Some(*root), end_index)?.position()
            };
            level_splices.push(LevelSplice {
                start: start.position(),
                end,
                items: splice
                    .insert
                    .into_iter()
                    .map(|v| Item::leaf(Vec::new(), v))
                    .collect(),
            });
        }

        self.apply_splices(*root, node, false, level_splices)
    }

    fn apply_splices(
        &mut self,
        root_hash: Ref,
        root: Arc<Node>,
        keyed: bool,
        splices: Vec<LevelSplice>,
    ) -> Result<Ref> {
        if splices.is_empty() {
            return Ok(root_hash);
        }

        let mut splices = splices;
        let mut level = 0u8;
        loop {
            debug!(level, splices = splices.len(), "rebuilding level");
            match self.apply_level(&root, root_hash, level, keyed, splices)? {
                LevelOutcome::Parent(next) => {
                    splices = next;
                    level += 1;
                }
                LevelOutcome::Root(parents) => {
                    let new_root = self.build_levels(parents, level + 1, keyed)?;
                    debug!(
                        old = %root_hash.short(),
                        new = %new_root.short(),
                        created = self.stats.nodes_created,
                        "edited tree"
                    );
                    return Ok(new_root);
                }
            }
        }
    }

    /// Rebuild the stretches of `level` touched by `splices`.
    fn apply_level(
        &mut self,
        root: &Arc<Node>,
        root_hash: Ref,
        level: u8,
        keyed: bool,
        splices: Vec<LevelSplice>,
    ) -> Result<LevelOutcome> {
        let store = self.store.clone();
        let store = store.as_ref();
        let is_top = level == root.level;
        let mut pending = splices.into_iter().peekable();
        let mut parent_splices = Vec::new();

        while let Some(first) = pending.peek() {
            let mut cur = SequenceCursor::at_position(store, root.clone(), Some(root_hash), &first.start)?;
            cur.seek_node_start();
            let group_start = cur.position();
            let mut chunker = LevelChunker::new(store, &self.config, level, keyed);
            let mut applied = false;
            let mut reads = 0;

            let resync_at = loop {
                let here = cur.position();
                if let Some(splice) = pending.next_if(|s| s.start <= here) {
                    for item in splice.items {
                        chunker.push(item)?;
                    }
                    if splice.end > here {
                        reads += cur.nodes_read();
                        cur = SequenceCursor::at_position(store, root.clone(), Some(root_hash), &splice.end)?;
                    }
                    applied = true;
                    continue;
                }
                if applied && !is_top && !chunker.has_pending() && cur.at_node_start() && cur.valid() {
                    break Some(here);
                }
                match cur.current_item() {
                    Some(item) => {
                        chunker.push(item)?;
                        self.stats.items_rechunked += 1;
                        cur.advance()?;
                    }
                    None => break None,
                }
            };

            let (parents, written) = chunker.finish()?;
            self.stats.record_level(level, written);
            self.stats.nodes_read += reads + cur.nodes_read();

            if is_top {
                return Ok(LevelOutcome::Root(parents));
            }
            let end = match resync_at {
                Some(position) => position.parent_of_node_start(),
                None => cur.position().parent_of_end(),
            };
            parent_splices.push(LevelSplice {
                start: group_start.parent_of_node_start(),
                end,
                items: parents,
            });
        }

        Ok(LevelOutcome::Parent(parent_splices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn tree_with(pattern: f64) -> (Arc<MemoryChunkStore>, ProllyTree) {
        let store = Arc::new(MemoryChunkStore::new());
        let tree = ProllyTree::new(store.clone(), ChunkConfig::with_pattern(pattern));
        (store, tree)
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:06}", i).into_bytes()
    }

    fn pairs(range: std::ops::Range<u32>) -> Vec<(Vec<u8>, Vec<u8>)> {
        range.map(|i| (key(i), format!("value{}", i).into_bytes())).collect()
    }

    fn height(tree: &ProllyTree, root: &Ref) -> u8 {
        tree.load_root(root).unwrap().level
    }

    #[test]
    fn test_tree_empty() {
        let (_store, mut tree) = tree_with(0.01);
        let root = tree.build(true, Vec::new()).unwrap();
        assert_eq!(tree.count(&root).unwrap(), 0);
        assert_eq!(tree.get(&root, b"missing").unwrap(), None);
        assert!(tree.items(&root).unwrap().is_empty());
    }

    #[test]
    fn test_tree_build_and_get() {
        let (store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..1000)).unwrap();
        assert_eq!(tree.count(&root).unwrap(), 1000);
        assert!(height(&tree, &root) >= 1);

        for i in [0, 1, 499, 999] {
            assert_eq!(
                tree.get(&root, &key(i)).unwrap(),
                Some(format!("value{}", i).into_bytes())
            );
        }
        assert_eq!(tree.get(&root, b"key9999999").unwrap(), None);

        let items = tree.items(&root).unwrap();
        assert_eq!(items, pairs(0..1000));

        tree.load_root(&root)
            .unwrap()
            .validate(store.as_ref(), "built")
            .unwrap();
    }

    #[test]
    fn test_build_is_deterministic() {
        let (_s1, mut t1) = tree_with(0.05);
        let (_s2, mut t2) = tree_with(0.05);
        let mut shuffled = pairs(0..500);
        shuffled.reverse();
        assert_eq!(
            t1.build_from_pairs(pairs(0..500)).unwrap(),
            t2.build_from_pairs(shuffled).unwrap()
        );
    }

    #[test]
    fn test_build_from_pairs_last_duplicate_wins() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree
            .build_from_pairs(vec![
                (b"k".to_vec(), b"first".to_vec()),
                (b"k".to_vec(), b"second".to_vec()),
            ])
            .unwrap();
        assert_eq!(tree.items(&root).unwrap(), vec![(b"k".to_vec(), b"second".to_vec())]);
    }

    #[test]
    fn test_edit_insert_update_delete() {
        let (store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..300)).unwrap();

        let edited = tree
            .edit(
                &root,
                vec![
                    Edit::Insert(b"key000150a".to_vec(), b"new".to_vec()),
                    Edit::Update(key(10), b"changed".to_vec()),
                    Edit::Delete(key(299)),
                    Edit::Insert(key(20), b"overwritten".to_vec()),
                ],
            )
            .unwrap();

        assert_eq!(tree.count(&edited).unwrap(), 300);
        assert_eq!(tree.get(&edited, b"key000150a").unwrap(), Some(b"new".to_vec()));
        assert_eq!(tree.get(&edited, &key(10)).unwrap(), Some(b"changed".to_vec()));
        assert_eq!(tree.get(&edited, &key(20)).unwrap(), Some(b"overwritten".to_vec()));
        assert_eq!(tree.get(&edited, &key(299)).unwrap(), None);
        // The old version is untouched.
        assert_eq!(tree.get(&root, &key(299)).unwrap(), Some(b"value299".to_vec()));

        tree.load_root(&edited)
            .unwrap()
            .validate(store.as_ref(), "edited")
            .unwrap();
    }

    #[test]
    fn test_edit_missing_key_fails() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..10)).unwrap();
        assert!(matches!(
            tree.edit(&root, vec![Edit::Delete(b"nope".to_vec())]),
            Err(Error::KeyNotFound(_))
        ));
        assert!(matches!(
            tree.edit(&root, vec![Edit::Update(b"nope".to_vec(), b"v".to_vec())]),
            Err(Error::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_empty_edit_keeps_root() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..50)).unwrap();
        assert_eq!(tree.edit(&root, Vec::new()).unwrap(), root);
    }

    #[test]
    fn test_edit_matches_rebuild() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..2000)).unwrap();

        let edits = vec![
            Edit::Delete(key(0)),
            Edit::Insert(b"key000777x".to_vec(), b"x".to_vec()),
            Edit::Update(key(1500), b"y".to_vec()),
            Edit::Delete(key(1999)),
        ];
        let edited = tree.edit(&root, edits).unwrap();

        let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = pairs(0..2000).into_iter().collect();
        expected.remove(&key(0));
        expected.insert(b"key000777x".to_vec(), b"x".to_vec());
        expected.insert(key(1500), b"y".to_vec());
        expected.remove(&key(1999));
        let rebuilt = tree.build_from_pairs(expected.into_iter().collect()).unwrap();

        assert_eq!(edited, rebuilt);
    }

    #[test]
    fn test_delete_everything_gives_empty_tree() {
        let (_store, mut tree) = tree_with(0.1);
        let root = tree.build_from_pairs(pairs(0..200)).unwrap();
        let edits = (0..200).map(|i| Edit::Delete(key(i))).collect();
        let edited = tree.edit(&root, edits).unwrap();
        assert_eq!(edited, tree.build(true, Vec::new()).unwrap());
    }

    #[test]
    fn test_growing_from_a_single_leaf() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..3)).unwrap();
        assert_eq!(height(&tree, &root), 0);
        let edits = (3..1000)
            .map(|i| Edit::Insert(key(i), format!("value{}", i).into_bytes()))
            .collect();
        let grown = tree.edit(&root, edits).unwrap();
        assert!(height(&tree, &grown) >= 1);
        assert_eq!(grown, tree.build_from_pairs(pairs(0..1000)).unwrap());
    }

    #[test]
    fn test_single_edit_touches_few_chunks() {
        let (store, mut tree) = tree_with(0.01);
        let root = tree.build_from_pairs(pairs(0..10_000)).unwrap();
        let before = store.count().unwrap();

        tree.reset_stats();
        let edited = tree
            .edit(&root, vec![Edit::Update(key(5_000), b"changed".to_vec())])
            .unwrap();
        let after = store.count().unwrap();

        assert_ne!(edited, root);
        let new_chunks = after - before;
        let depth = height(&tree, &edited) as usize + 1;
        assert!(new_chunks >= 1);
        assert!(
            new_chunks <= 2 * depth + 2,
            "edit wrote {} chunks for a tree of depth {}",
            new_chunks,
            depth
        );
        assert!(tree.stats().items_rechunked < 2_000);
    }

    #[test]
    fn test_iter_range_and_resume() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_from_pairs(pairs(0..500)).unwrap();

        let keys: Vec<Vec<u8>> = tree
            .iter(&root, Some(&key(100)), Some(&key(110)))
            .unwrap()
            .map(|item| item.unwrap().key)
            .collect();
        assert_eq!(keys, (100..110).map(key).collect::<Vec<_>>());

        let mut iter = tree.iter(&root, None, None).unwrap();
        for _ in 0..250 {
            iter.next().unwrap().unwrap();
        }
        let position = iter.position();
        drop(iter);
        let rest: Vec<Vec<u8>> = tree
            .iter_from(&root, &position)
            .unwrap()
            .map(|item| item.unwrap().key)
            .collect();
        assert_eq!(rest, (250..500).map(key).collect::<Vec<_>>());

        // A position cut short would walk parent tuples instead of items.
        assert!(height(&tree, &root) >= 1);
        let shallow = Position(position.0[..1].to_vec());
        assert!(matches!(tree.iter_from(&root, &shallow), Err(Error::InvalidEdit(_))));
    }

    #[test]
    fn test_malformed_root_is_an_error() {
        let (store, tree) = tree_with(0.05);
        let empty_meta = Node::new(1).save(store.as_ref()).unwrap();
        assert!(matches!(tree.get(&empty_meta, b"k"), Err(Error::CorruptEncoding(_))));
        assert!(matches!(tree.get_index(&empty_meta, 0), Err(Error::CorruptEncoding(_))));

        // A meta node whose child is at the wrong level.
        let leaf = Node::new_leaf().save(store.as_ref()).unwrap();
        let mut skipping = Node::new(2);
        skipping.push(
            Item {
                key: b"k".to_vec(),
                value: leaf.as_bytes().to_vec(),
                count: 1,
            },
            true,
        );
        let root = skipping.save(store.as_ref()).unwrap();
        assert!(matches!(tree.get(&root, b"k"), Err(Error::CorruptEncoding(_))));
    }

    #[test]
    fn test_list_build_and_index() {
        let (store, mut tree) = tree_with(0.05);
        let values: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let root = tree.build_list(values.clone()).unwrap();
        assert_eq!(tree.count(&root).unwrap(), 1000);
        for i in [0u64, 1, 500, 999] {
            assert_eq!(
                tree.get_index(&root, i).unwrap().unwrap().value,
                values[i as usize]
            );
        }
        assert!(tree.get_index(&root, 1000).unwrap().is_none());
        tree.load_root(&root).unwrap().validate(store.as_ref(), "list").unwrap();
    }

    #[test]
    fn test_list_splice_matches_rebuild() {
        let (_store, mut tree) = tree_with(0.05);
        let mut values: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let root = tree.build_list(values.clone()).unwrap();

        let edited = tree
            .splice(
                &root,
                vec![
                    ListSplice {
                        index: 10,
                        remove: 5,
                        insert: vec![b"a".to_vec()],
                    },
                    ListSplice {
                        index: 600,
                        remove: 0,
                        insert: vec![b"b".to_vec(), b"c".to_vec()],
                    },
                    ListSplice {
                        index: 1000,
                        remove: 0,
                        insert: vec![b"end".to_vec()],
                    },
                ],
            )
            .unwrap();

        values.push(b"end".to_vec());
        values.splice(600..600, vec![b"b".to_vec(), b"c".to_vec()]);
        values.splice(10..15, vec![b"a".to_vec()]);
        assert_eq!(edited, tree.build_list(values.clone()).unwrap());
        assert_eq!(tree.count(&edited).unwrap(), values.len() as u64);
    }

    #[test]
    fn test_list_splice_bounds() {
        let (_store, mut tree) = tree_with(0.05);
        let root = tree.build_list(vec![b"x".to_vec(); 10]).unwrap();
        assert!(matches!(
            tree.splice(
                &root,
                vec![ListSplice {
                    index: 8,
                    remove: 5,
                    insert: Vec::new()
                }]
            ),
            Err(Error::IndexOutOfRange { len: 10, .. })
        ));
        assert!(matches!(
            tree.splice(
                &root,
                vec![
                    ListSplice {
                        index: 5,
                        remove: 2,
                        insert: Vec::new()
                    },
                    ListSplice {
                        index: 6,
                        remove: 0,
                        insert: Vec::new()
                    }
                ]
            ),
            Err(Error::InvalidEdit(_))
        ));
    }

    fn be(k: u16) -> Vec<u8> {
        k.to_be_bytes().to_vec()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_edit_matches_rebuild(
            initial in proptest::collection::btree_map(0u16..600, 0u8..4, 0..300),
            ops in proptest::collection::vec((0u16..600, 0u8..3, 0u8..4), 0..40),
        ) {
            let (store, mut tree) = tree_with(0.1);
            let mut model: BTreeMap<Vec<u8>, Vec<u8>> =
                initial.iter().map(|(k, v)| (be(*k), vec![*v])).collect();
            let root = tree.build_from_pairs(model.clone().into_iter().collect()).unwrap();

            let mut seen = std::collections::HashSet::new();
            let mut edits = Vec::new();
            for (k, op, v) in ops {
                if !seen.insert(k) {
                    continue;
                }
                let k = be(k);
                let present = model.contains_key(&k);
                match (op, present) {
                    (1, true) => {
                        model.remove(&k);
                        edits.push(Edit::Delete(k));
                    }
                    (2, true) => {
                        model.insert(k.clone(), vec![v]);
                        edits.push(Edit::Update(k, vec![v]));
                    }
                    _ => {
                        model.insert(k.clone(), vec![v]);
                        edits.push(Edit::Insert(k, vec![v]));
                    }
                }
            }

            let edited = tree.edit(&root, edits).unwrap();
            let rebuilt = tree.build_from_pairs(model.clone().into_iter().collect()).unwrap();
            prop_assert_eq!(edited, rebuilt);
            prop_assert_eq!(tree.items(&edited).unwrap(), model.into_iter().collect::<Vec<_>>());
            tree.load_root(&edited).unwrap().validate(store.as_ref(), "prop").unwrap();
        }
    }
}
