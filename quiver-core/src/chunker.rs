//! Content-defined node boundaries.
//!
//! Whether an item closes a node depends only on the item itself (its key and
//! value, hashed with the seed and the tree level), plus the minimum and
//! maximum node sizes. Because the decision is local, a run of items that
//! appears in two sequences is split at the same places in both, and a
//! rebuild that starts at an old node boundary falls back into step with the
//! old boundaries as soon as it passes the edited region.

use sha2::{Digest, Sha256};

use crate::config::ChunkConfig;
use crate::error::Result;
use crate::hash::Ref;
use crate::node::{Item, Node};
use crate::store::ChunkStore;

/// Hash of one item for boundary decisions.
#[inline]
pub fn boundary_hash(seed: u32, level: u8, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update([level]);
    hasher.update((key.len() as u32).to_be_bytes());
    hasher.update(key);
    hasher.update(value);
    let hash_bytes = hasher.finalize();
    u32::from_be_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]])
}

/// Decides where nodes end at one level.
#[derive(Debug, Clone)]
pub struct Splitter {
    threshold: u32,
    seed: u32,
    level: u8,
    min_items: usize,
    max_items: usize,
    count: usize,
}

impl Splitter {
    pub fn new(config: &ChunkConfig, level: u8) -> Self {
        Splitter {
            threshold: config.threshold(),
            seed: config.seed,
            level,
            min_items: config.min_node_items,
            max_items: config.max_node_items,
            count: 0,
        }
    }

    /// Feed the next item. Returns true if the item is the last of its node.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> bool {
        self.count += 1;
        let boundary = self.count >= self.max_items
            || (self.count >= self.min_items
                && boundary_hash(self.seed, self.level, key, value) < self.threshold);
        if boundary {
            self.count = 0;
        }
        boundary
    }

    /// Items fed since the last boundary.
    pub fn pending(&self) -> usize {
        self.count
    }
}

/// True if `items` would chunk into a single leaf.
pub fn fits_single_leaf(config: &ChunkConfig, items: &[Item]) -> bool {
    let mut splitter = Splitter::new(config, 0);
    let last = items.len().saturating_sub(1);
    items
        .iter()
        .enumerate()
        .all(|(i, item)| !splitter.append(&item.key, &item.value) || i == last)
}

/// Groups a stream of items at one level into nodes, writing each node as it
/// closes and collecting the parent-level tuples that point at them.
pub struct LevelChunker<'a> {
    store: &'a dyn ChunkStore,
    splitter: Splitter,
    keyed: bool,
    level: u8,
    current: Node,
    parents: Vec<Item>,
    nodes_written: usize,
}

impl<'a> LevelChunker<'a> {
    pub fn new(store: &'a dyn ChunkStore, config: &ChunkConfig, level: u8, keyed: bool) -> Self {
        LevelChunker {
            store,
            splitter: Splitter::new(config, level),
            keyed,
            level,
            current: Node::new(level),
            parents: Vec::new(),
            nodes_written: 0,
        }
    }

    pub fn push(&mut self, item: Item) -> Result<()> {
        let boundary = self.splitter.append(&item.key, &item.value);
        self.current.push(item, self.keyed);
        if boundary {
            self.flush()?;
        }
        Ok(())
    }

    /// True if items have been pushed since the last node closed.
    pub fn has_pending(&self) -> bool {
        !self.current.is_empty()
    }

    fn flush(&mut self) -> Result<()> {
        let node = std::mem::replace(&mut self.current, Node::new(self.level));
        let hash = node.save(self.store)?;
        self.nodes_written += 1;
        self.parents.push(parent_item(&node, hash, self.keyed));
        Ok(())
    }

    /// Close the trailing node, if any. Returns the parent tuples and the
    /// number of nodes written.
    pub fn finish(mut self) -> Result<(Vec<Item>, usize)> {
        if self.has_pending() {
            self.flush()?;
        }
        Ok((self.parents, self.nodes_written))
    }
}

/// The tuple a parent holds for `node`.
pub fn parent_item(node: &Node, hash: Ref, keyed: bool) -> Item {
    Item {
        key: if keyed {
            node.last_key().to_vec()
        } else {
            Vec::new()
        },
        value: hash.as_bytes().to_vec(),
        count: node.total_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item::leaf(format!("key{:05}", i).into_bytes(), b"v".to_vec()))
            .collect()
    }

    #[test]
    fn test_boundary_hash_deterministic() {
        assert_eq!(
            boundary_hash(42, 0, b"k", b"v"),
            boundary_hash(42, 0, b"k", b"v")
        );
        assert_ne!(
            boundary_hash(42, 0, b"k", b"v"),
            boundary_hash(42, 1, b"k", b"v")
        );
        assert_ne!(
            boundary_hash(42, 0, b"k", b"v"),
            boundary_hash(43, 0, b"k", b"v")
        );
    }

    #[test]
    fn test_splitter_respects_min_and_max() {
        let config = ChunkConfig {
            pattern: 1.0,
            min_node_items: 3,
            max_node_items: 5,
            ..ChunkConfig::default()
        };
        let mut splitter = Splitter::new(&config, 0);
        // pattern 1.0: every item qualifies once the minimum is reached.
        assert!(!splitter.append(b"a", b""));
        assert!(!splitter.append(b"b", b""));
        assert!(splitter.append(b"c", b""));
        assert_eq!(splitter.pending(), 0);

        let config = ChunkConfig {
            pattern: 1e-9,
            min_node_items: 2,
            max_node_items: 4,
            ..ChunkConfig::default()
        };
        let mut splitter = Splitter::new(&config, 0);
        let closes: Vec<bool> = (0..8u8).map(|i| splitter.append(&[i], b"")).collect();
        assert_eq!(closes, vec![false, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_boundaries_are_local() {
        // Same run of items, different predecessors: boundaries inside the
        // shared run land on the same items.
        let config = ChunkConfig::with_pattern(0.1);
        let run = items(500);

        let boundaries = |prefix: &[Item]| -> Vec<Vec<u8>> {
            let mut splitter = Splitter::new(&config, 0);
            let mut out = Vec::new();
            for item in prefix.iter().chain(run.iter()) {
                if splitter.append(&item.key, &item.value) {
                    out.push(item.key.clone());
                }
            }
            out
        };

        let from = b"key00100".to_vec();
        let after = |b: Vec<Vec<u8>>| b.into_iter().filter(|k| *k >= from).collect::<Vec<_>>();
        let plain = after(boundaries(&[]));
        let shifted = after(boundaries(&[Item::leaf(b"aaa".to_vec(), b"x".to_vec())]));
        assert!(!plain.is_empty());
        assert_eq!(plain, shifted);
    }

    #[test]
    fn test_level_chunker_emits_parents() {
        let store = MemoryChunkStore::new();
        let config = ChunkConfig::with_pattern(0.1);
        let mut chunker = LevelChunker::new(&store, &config, 0, true);
        for item in items(300) {
            chunker.push(item).unwrap();
        }
        let (parents, written) = chunker.finish().unwrap();
        assert_eq!(parents.len(), written);
        assert!(parents.len() > 1);
        assert_eq!(parents.iter().map(|p| p.count).sum::<u64>(), 300);
        assert_eq!(parents.last().unwrap().key, b"key00299".to_vec());
        assert_eq!(store.count().unwrap(), written);
    }

    #[test]
    fn test_fits_single_leaf() {
        let config = ChunkConfig::with_pattern(0.01);
        assert!(fits_single_leaf(&config, &[]));
        assert!(fits_single_leaf(&config, &items(1)));
        let always = ChunkConfig::with_pattern(1.0);
        assert!(fits_single_leaf(&always, &items(2)));
        assert!(!fits_single_leaf(&always, &items(3)));
    }
}
