//! Diff algorithm for sequences and values.
//!
//! Maps and sets are walked in lockstep with a leaf cursor on each side and
//! their items merge-joined by key. Whenever both cursors stand at the start
//! of stored nodes with the same ref, the whole subtree is skipped on both
//! sides without being read. Because node boundaries depend only on content,
//! the two sides fall back into step right after each changed region, so the
//! work done is proportional to the size of the difference plus the depth of
//! the trees. Sequences of different heights need no special handling: both
//! cursors always walk leaf items.
//!
//! Lists have no keys to join on, so [`ListDiff`] aligns the two sides by
//! their stored leaves instead. From the first differing item it reads ahead
//! on both sides until one side reaches a leaf the other has already passed,
//! then turns the items in between into [`Splice`]s with a longest common
//! subsequence. An insert at the front of a long list is one splice.
//!
//! Results are produced lazily. A diff can be abandoned at any point and
//! resumed later: [`DiffIterator::starting_after`] takes the last key seen,
//! [`ListDiff::starting_at`] the pair of indices after the last splice, and
//! [`ValueDiff::starting_after`] the [`DiffResume`] it reported.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::codec::decode_item;
use crate::cursor::SequenceCursor;
use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::node::Node;
use crate::store::ChunkStore;
use crate::value::{Kind, Sequence, Value};
use crate::value_store::ValueStore;

/// Regions whose item matrix is larger than this are reported as a single
/// splice instead of being aligned item by item.
const MAX_SPLICE_MATRIX: usize = 1 << 22;

/// A key-value pair was added
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Added {
    pub key: Arc<[u8]>,
    pub value: Arc<[u8]>,
}

/// A key was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub key: Arc<[u8]>,
    pub old_value: Arc<[u8]>,
}

/// A key's value was modified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modified {
    pub key: Arc<[u8]>,
    pub old_value: Arc<[u8]>,
    pub new_value: Arc<[u8]>,
}

/// Diff event representing a change between two maps or sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
    Added(Added),
    Removed(Removed),
    Modified(Modified),
}

impl DiffEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            DiffEvent::Added(a) => &a.key,
            DiffEvent::Removed(r) => &r.key,
            DiffEvent::Modified(m) => &m.key,
        }
    }

    pub fn old_value(&self) -> Option<&[u8]> {
        match self {
            DiffEvent::Added(_) => None,
            DiffEvent::Removed(r) => Some(&r.old_value),
            DiffEvent::Modified(m) => Some(&m.old_value),
        }
    }

    pub fn new_value(&self) -> Option<&[u8]> {
        match self {
            DiffEvent::Added(a) => Some(&a.value),
            DiffEvent::Removed(_) => None,
            DiffEvent::Modified(m) => Some(&m.new_value),
        }
    }
}

/// Statistics from a diff operation
#[derive(Debug, Clone, Default)]
pub struct DiffStats {
    pub subtrees_skipped: usize,
    pub items_compared: usize,
    pub nodes_read: usize,
}

/// Streaming iterator for diff events between two keyed sequences.
///
/// ```ignore
/// let mut iter = DiffIterator::new(store, old_root, new_root)?;
/// for event in &mut iter {
///     match event? {
///         DiffEvent::Added(a) => println!("+ {:?}", a.key),
///         DiffEvent::Removed(r) => println!("- {:?}", r.key),
///         DiffEvent::Modified(m) => println!("M {:?}", m.key),
///     }
/// }
/// println!("{:?}", iter.stats());
/// ```
pub struct DiffIterator<'a> {
    old_cursor: SequenceCursor<'a>,
    new_cursor: SequenceCursor<'a>,
    last_key: Option<Arc<[u8]>>,
    done: bool,
    stats: DiffStats,
}

impl<'a> DiffIterator<'a> {
    /// Diff two keyed sequences given by their root node and, if stored, its ref.
    pub fn new(
        store: &'a dyn ChunkStore,
        old: (Arc<Node>, Option<Ref>),
        new: (Arc<Node>, Option<Ref>),
    ) -> Result<Self> {
        Self::starting_after(store, old, new, None)
    }

    /// Like [`DiffIterator::new`], but only reports keys after `after`.
    pub fn starting_after(
        store: &'a dyn ChunkStore,
        old: (Arc<Node>, Option<Ref>),
        new: (Arc<Node>, Option<Ref>),
        after: Option<&[u8]>,
    ) -> Result<Self> {
        ensure_keyed(&old.0)?;
        ensure_keyed(&new.0)?;
        let mut stats = DiffStats::default();
        let identical = old.1.is_some() && old.1 == new.1;
        if identical {
            stats.subtrees_skipped += 1;
        }

        let (old_cursor, new_cursor) = match after {
            None => (
                SequenceCursor::at_start(store, old.0, old.1, 0)?,
                SequenceCursor::at_start(store, new.0, new.1, 0)?,
            ),
            Some(key) => (
                cursor_after_key(store, old, key)?,
                cursor_after_key(store, new, key)?,
            ),
        };

        Ok(DiffIterator {
            old_cursor,
            new_cursor,
            last_key: after.map(Arc::from),
            done: identical,
            stats,
        })
    }

    /// Get statistics from the diff so far.
    pub fn stats(&self) -> DiffStats {
        DiffStats {
            nodes_read: self.old_cursor.nodes_read() + self.new_cursor.nodes_read(),
            ..self.stats.clone()
        }
    }

    /// Key of the last event produced; pass it to
    /// [`DiffIterator::starting_after`] to resume.
    pub fn last_key(&self) -> Option<&Arc<[u8]>> {
        self.last_key.as_ref()
    }

    fn step(&mut self) -> Result<Option<DiffEvent>> {
        loop {
            let old_key = self.old_cursor.current_key().map(|k| k.to_vec());
            let new_key = self.new_cursor.current_key().map(|k| k.to_vec());

            let order = match (&old_key, &new_key) {
                (None, None) => return Ok(None),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(old), Some(new)) => old.cmp(new),
            };

            match order {
                Ordering::Less => {
                    let event = DiffEvent::Removed(Removed {
                        key: Arc::from(old_key.unwrap_or_default()),
                        old_value: Arc::from(self.old_cursor.current_value().unwrap_or_default()),
                    });
                    self.old_cursor.advance()?;
                    return Ok(Some(event));
                }
                Ordering::Greater => {
                    let event = DiffEvent::Added(Added {
                        key: Arc::from(new_key.unwrap_or_default()),
                        value: Arc::from(self.new_cursor.current_value().unwrap_or_default()),
                    });
                    self.new_cursor.advance()?;
                    return Ok(Some(event));
                }
                Ordering::Equal => {
                    if let Some(levels_up) = shared_subtree(&self.old_cursor, &self.new_cursor) {
                        self.stats.subtrees_skipped += 1;
                        self.old_cursor.skip_subtree(levels_up)?;
                        self.new_cursor.skip_subtree(levels_up)?;
                        continue;
                    }

                    self.stats.items_compared += 1;
                    let old_value = self.old_cursor.current_value().unwrap_or_default();
                    let new_value = self.new_cursor.current_value().unwrap_or_default();
                    let event = (old_value != new_value).then(|| {
                        DiffEvent::Modified(Modified {
                            key: Arc::from(old_key.unwrap_or_default()),
                            old_value: Arc::from(old_value),
                            new_value: Arc::from(new_value),
                        })
                    });
                    self.old_cursor.advance()?;
                    self.new_cursor.advance()?;
                    if event.is_some() {
                        return Ok(event);
                    }
                }
            }
        }
    }
}

fn ensure_keyed(root: &Node) -> Result<()> {
    if !root.is_empty() && !root.is_keyed() {
        return Err(Error::InvalidEdit("keyed diff of an indexed sequence".into()));
    }
    Ok(())
}

fn ensure_indexed(root: &Node) -> Result<()> {
    if root.is_keyed() {
        return Err(Error::InvalidEdit("list diff of a keyed sequence".into()));
    }
    Ok(())
}

/// Highest level at which both cursors start the same stored node.
fn shared_subtree(old: &SequenceCursor<'_>, new: &SequenceCursor<'_>) -> Option<usize> {
    let old = old.subtrees_starting_here();
    let new = new.subtrees_starting_here();
    (0..old.len().min(new.len()))
        .rev()
        .find(|&j| old[j].is_some() && old[j] == new[j])
}

fn cursor_after_key<'a>(
    store: &'a dyn ChunkStore,
    root: (Arc<Node>, Option<Ref>),
    key: &[u8],
) -> Result<SequenceCursor<'a>> {
    let mut cursor = SequenceCursor::at_key(store, root.0, root.1, key)?;
    if cursor.current_key() == Some(key) {
        cursor.advance()?;
    }
    Ok(cursor)
}

impl<'a> Iterator for DiffIterator<'a> {
    type Item = Result<DiffEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(event)) => {
                self.last_key = Some(Arc::from(event.key()));
                Some(Ok(event))
            }
            Ok(None) => {
                self.done = true;
                let stats = self.stats();
                debug!(
                    skipped = stats.subtrees_skipped,
                    compared = stats.items_compared,
                    nodes_read = stats.nodes_read,
                    "diff finished"
                );
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Diff two maps' or sets' sequences of a value store.
pub fn diff_sequences<'a>(vs: &'a ValueStore, old: &Sequence, new: &Sequence) -> Result<DiffIterator<'a>> {
    DiffIterator::new(vs.chunks().as_ref(), vs.sequence_root(old)?, vs.sequence_root(new)?)
}

/// Diff two lists' sequences of a value store.
pub fn diff_lists<'a>(vs: &'a ValueStore, old: &Sequence, new: &Sequence) -> Result<ListDiff<'a>> {
    ListDiff::new(vs.chunks().as_ref(), vs.sequence_root(old)?, vs.sequence_root(new)?)
}

/// Replace `removed` (starting at old index `at`) with `added` (starting at
/// new index `new_at`). Items are encoded list elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Splice {
    pub at: u64,
    pub new_at: u64,
    pub removed: Vec<Vec<u8>>,
    pub added: Vec<Vec<u8>>,
}

impl Splice {
    /// Old index just past the removed items.
    pub fn old_end(&self) -> u64 {
        self.at + self.removed.len() as u64
    }

    /// New index just past the added items.
    pub fn new_end(&self) -> u64 {
        self.new_at + self.added.len() as u64
    }
}

/// Streaming splice diff between two lists, in increasing index order.
pub struct ListDiff<'a> {
    old_cursor: SequenceCursor<'a>,
    new_cursor: SequenceCursor<'a>,
    pending: VecDeque<Splice>,
    resume: (u64, u64),
    rescanned: usize,
    done: bool,
    stats: DiffStats,
}

impl<'a> ListDiff<'a> {
    pub fn new(
        store: &'a dyn ChunkStore,
        old: (Arc<Node>, Option<Ref>),
        new: (Arc<Node>, Option<Ref>),
    ) -> Result<Self> {
        Self::starting_at(store, old, new, 0, 0)
    }

    /// Diff the old list from `old_index` on against the new list from
    /// `new_index` on. Splice indices stay relative to the whole lists.
    pub fn starting_at(
        store: &'a dyn ChunkStore,
        old: (Arc<Node>, Option<Ref>),
        new: (Arc<Node>, Option<Ref>),
        old_index: u64,
        new_index: u64,
    ) -> Result<Self> {
        ensure_indexed(&old.0)?;
        ensure_indexed(&new.0)?;
        let mut stats = DiffStats::default();
        let identical = old.1.is_some() && old.1 == new.1;
        if identical {
            stats.subtrees_skipped += 1;
        }
        Ok(ListDiff {
            old_cursor: SequenceCursor::at_index(store, old.0, old.1, old_index)?,
            new_cursor: SequenceCursor::at_index(store, new.0, new.1, new_index)?,
            pending: VecDeque::new(),
            resume: (old_index, new_index),
            rescanned: 0,
            done: identical,
            stats,
        })
    }

    pub fn stats(&self) -> DiffStats {
        DiffStats {
            nodes_read: self.old_cursor.nodes_read() + self.new_cursor.nodes_read() + self.rescanned,
            ..self.stats.clone()
        }
    }

    /// Old and new indices just past the last splice produced; pass them to
    /// [`ListDiff::starting_at`] to resume.
    pub fn resume_point(&self) -> (u64, u64) {
        self.resume
    }

    /// Move both cursors past the items they have in common. Returns false
    /// once both lists are exhausted.
    fn skip_common(&mut self) -> Result<bool> {
        loop {
            match (self.old_cursor.valid(), self.new_cursor.valid()) {
                (false, false) => return Ok(false),
                (true, true) => {}
                _ => return Ok(true),
            }
            if let Some(levels_up) = shared_subtree(&self.old_cursor, &self.new_cursor) {
                self.stats.subtrees_skipped += 1;
                self.old_cursor.skip_subtree(levels_up)?;
                self.new_cursor.skip_subtree(levels_up)?;
                continue;
            }
            self.stats.items_compared += 1;
            if self.old_cursor.current_value() != self.new_cursor.current_value() {
                return Ok(true);
            }
            self.old_cursor.advance()?;
            self.new_cursor.advance()?;
        }
    }

    /// Read ahead from a difference until one side starts a stored leaf the
    /// other side has already passed, or both lists end, and queue the
    /// splices between the two cursors and that point.
    fn scan_region(&mut self) -> Result<()> {
        let at = self.old_cursor.index();
        let new_at = self.new_cursor.index();
        let mut old = RegionScan::new(self.old_cursor.clone());
        let mut new = RegionScan::new(self.new_cursor.clone());

        let (old_stop, new_stop) = loop {
            if let Some(stop) = new.current_leaf().and_then(|leaf| old.passed(&leaf)) {
                break (stop, new.here());
            }
            if let Some(stop) = old.current_leaf().and_then(|leaf| new.passed(&leaf)) {
                break (old.here(), stop);
            }
            if old.exhausted() && new.exhausted() {
                break (old.here(), new.here());
            }
            old.next_leaf()?;
            new.next_leaf()?;
        };

        let (old_count, old_cursor) = old_stop;
        let (new_count, new_cursor) = new_stop;
        self.rescanned += old.cursor.nodes_read().saturating_sub(old_cursor.nodes_read());
        self.rescanned += new.cursor.nodes_read().saturating_sub(new_cursor.nodes_read());
        self.old_cursor = old_cursor;
        self.new_cursor = new_cursor;

        debug!(at, new_at, removed = old_count, added = new_count, "list region differs");
        self.pending.extend(calc_splices(
            at,
            new_at,
            &old.items[..old_count],
            &new.items[..new_count],
            MAX_SPLICE_MATRIX,
        ));
        Ok(())
    }
}

/// One side of a region being read ahead.
struct RegionScan<'a> {
    cursor: SequenceCursor<'a>,
    items: Vec<Vec<u8>>,
    /// Stored leaves started so far, with the item count and cursor there
    leaves: HashMap<Ref, (usize, SequenceCursor<'a>)>,
}

impl<'a> RegionScan<'a> {
    fn new(cursor: SequenceCursor<'a>) -> Self {
        let mut scan = RegionScan {
            cursor,
            items: Vec::new(),
            leaves: HashMap::new(),
        };
        scan.record_leaf();
        scan
    }

    fn exhausted(&self) -> bool {
        !self.cursor.valid()
    }

    fn here(&self) -> (usize, SequenceCursor<'a>) {
        (self.items.len(), self.cursor.clone())
    }

    /// Ref of the stored leaf starting at the cursor, if any.
    fn current_leaf(&self) -> Option<Ref> {
        if !self.cursor.at_node_start() {
            return None;
        }
        self.cursor.subtrees_starting_here().first().copied().flatten()
    }

    fn passed(&self, leaf: &Ref) -> Option<(usize, SequenceCursor<'a>)> {
        self.leaves.get(leaf).cloned()
    }

    fn record_leaf(&mut self) {
        if let Some(leaf) = self.current_leaf() {
            let here = self.here();
            self.leaves.entry(leaf).or_insert(here);
        }
    }

    /// Buffer items up to the start of the next leaf.
    fn next_leaf(&mut self) -> Result<()> {
        while let Some(value) = self.cursor.current_value() {
            self.items.push(value.to_vec());
            self.cursor.advance()?;
            if self.cursor.at_node_start() {
                break;
            }
        }
        self.record_leaf();
        Ok(())
    }
}

impl<'a> Iterator for ListDiff<'a> {
    type Item = Result<Splice>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(splice) = self.pending.pop_front() {
                self.resume = (splice.old_end(), splice.new_end());
                return Some(Ok(splice));
            }
            if self.done {
                return None;
            }
            let step = match self.skip_common() {
                Ok(true) => self.scan_region(),
                Ok(false) => {
                    self.done = true;
                    let stats = self.stats();
                    debug!(
                        skipped = stats.subtrees_skipped,
                        compared = stats.items_compared,
                        nodes_read = stats.nodes_read,
                        "list diff finished"
                    );
                    continue;
                }
                Err(err) => Err(err),
            };
            if let Err(err) = step {
                self.done = true;
                self.pending.clear();
                return Some(Err(err));
            }
        }
    }
}

/// Minimal splices turning `old` (at old index `at`) into `new` (at new
/// index `new_at`), by longest common subsequence. Regions whose matrix would
/// exceed `max_matrix` cells become one splice after trimming the common
/// prefix and suffix.
fn calc_splices(at: u64, new_at: u64, old: &[Vec<u8>], new: &[Vec<u8>], max_matrix: usize) -> Vec<Splice> {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let (old, new) = (&old[prefix..], &new[prefix..]);
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let (old, new) = (&old[..old.len() - suffix], &new[..new.len() - suffix]);
    let (at, new_at) = (at + prefix as u64, new_at + prefix as u64);

    if old.is_empty() && new.is_empty() {
        return Vec::new();
    }
    if old.is_empty() || new.is_empty() || old.len().saturating_mul(new.len()) > max_matrix {
        return vec![Splice {
            at,
            new_at,
            removed: old.to_vec(),
            added: new.to_vec(),
        }];
    }

    // lcs[i * width + j] is the common subsequence length of old[i..] and new[j..]
    let (n, m) = (old.len(), new.len());
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut splices = Vec::new();
    let mut current: Option<Splice> = None;
    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && old[i] == new[j] {
            splices.extend(current.take());
            i += 1;
            j += 1;
            continue;
        }
        let splice = current.get_or_insert_with(|| Splice {
            at: at + i as u64,
            new_at: new_at + j as u64,
            removed: Vec::new(),
            added: Vec::new(),
        });
        if j == m || (i < n && lcs[(i + 1) * width + j] >= lcs[i * width + j + 1]) {
            splice.removed.push(old[i].clone());
            i += 1;
        } else {
            splice.added.push(new[j].clone());
            j += 1;
        }
    }
    splices.extend(current);
    splices
}

/// Where in a value a change happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKey {
    /// The values themselves differ and cannot be compared element-wise
    Root,
    Key(Value),
    /// Removed and modified elements carry their old index, added ones
    /// their new index.
    Index(u64),
    Field(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One decoded change between two values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange {
    pub kind: ChangeKind,
    pub key: ChangeKey,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// How far a [`ValueDiff`] got, for resuming it with
/// [`ValueDiff::starting_after`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffResume {
    /// Encoded key or member of the last map or set change
    Key(Arc<[u8]>),
    /// Old and new list indices just past the last list change
    Index { old: u64, new: u64 },
    /// Number of struct or root changes already produced
    Count(usize),
}

/// Lazy, decoded diff of two values.
///
/// Collections of the same kind are diffed element-wise, structs with the same
/// name field by field. Anything else is a single `Root` change. A list splice
/// becomes `Modified` changes for the elements it replaces one for one,
/// followed by `Removed` or `Added` for the rest.
pub struct ValueDiff<'a> {
    inner: ValueDiffInner<'a>,
    last: Option<DiffResume>,
}

enum ValueDiffInner<'a> {
    Keyed {
        events: DiffIterator<'a>,
        kind: Kind,
    },
    List {
        splices: ListDiff<'a>,
        current: Option<Splice>,
        offset: usize,
    },
    Eager {
        changes: std::vec::IntoIter<ValueChange>,
        produced: usize,
    },
}

impl<'a> ValueDiff<'a> {
    /// Diff `old` against `new`, skipping what a previous diff of the same
    /// values already reported up to `resume`.
    pub fn starting_after(vs: &'a ValueStore, old: &Value, new: &Value, resume: &DiffResume) -> Result<Self> {
        start_value_diff(vs, old, new, Some(resume))
    }

    pub fn stats(&self) -> DiffStats {
        match &self.inner {
            ValueDiffInner::Keyed { events, .. } => events.stats(),
            ValueDiffInner::List { splices, .. } => splices.stats(),
            ValueDiffInner::Eager { .. } => DiffStats::default(),
        }
    }

    /// Resume point after the last change produced.
    pub fn last_key(&self) -> Option<&DiffResume> {
        self.last.as_ref()
    }
}

pub fn diff_values<'a>(vs: &'a ValueStore, old: &Value, new: &Value) -> Result<ValueDiff<'a>> {
    start_value_diff(vs, old, new, None)
}

fn resume_mismatch(resume: &DiffResume, kind: Kind) -> Error {
    Error::InvalidEdit(format!("cannot resume a {:?} diff from {:?}", kind, resume))
}

fn keyed_value_diff<'a>(
    vs: &'a ValueStore,
    old: &Sequence,
    new: &Sequence,
    kind: Kind,
    resume: Option<&DiffResume>,
) -> Result<ValueDiff<'a>> {
    let after = match resume {
        None => None,
        Some(DiffResume::Key(key)) => Some(key.as_ref()),
        Some(other) => return Err(resume_mismatch(other, kind)),
    };
    let events = DiffIterator::starting_after(
        vs.chunks().as_ref(),
        vs.sequence_root(old)?,
        vs.sequence_root(new)?,
        after,
    )?;
    Ok(ValueDiff {
        inner: ValueDiffInner::Keyed { events, kind },
        last: resume.cloned(),
    })
}

fn list_value_diff<'a>(
    vs: &'a ValueStore,
    old: &Sequence,
    new: &Sequence,
    resume: Option<&DiffResume>,
) -> Result<ValueDiff<'a>> {
    let (old_index, new_index) = match resume {
        None => (0, 0),
        Some(DiffResume::Index { old, new }) => (*old, *new),
        Some(other) => return Err(resume_mismatch(other, Kind::List)),
    };
    let splices = ListDiff::starting_at(
        vs.chunks().as_ref(),
        vs.sequence_root(old)?,
        vs.sequence_root(new)?,
        old_index,
        new_index,
    )?;
    Ok(ValueDiff {
        inner: ValueDiffInner::List {
            splices,
            current: None,
            offset: 0,
        },
        last: resume.cloned(),
    })
}

fn start_value_diff<'a>(
    vs: &'a ValueStore,
    old: &Value,
    new: &Value,
    resume: Option<&DiffResume>,
) -> Result<ValueDiff<'a>> {
    let mut changes = match (old, new) {
        (Value::Map(a), Value::Map(b)) => return keyed_value_diff(vs, a.sequence(), b.sequence(), Kind::Map, resume),
        (Value::Set(a), Value::Set(b)) => return keyed_value_diff(vs, a.sequence(), b.sequence(), Kind::Set, resume),
        (Value::List(a), Value::List(b)) => return list_value_diff(vs, a.sequence(), b.sequence(), resume),
        (Value::Struct(a), Value::Struct(b)) if a.name == b.name => {
            let mut changes = Vec::new();
            let names: BTreeSet<&String> = a.fields.keys().chain(b.fields.keys()).collect();
            for name in names {
                let (old, new) = (a.fields.get(name), b.fields.get(name));
                let kind = match (old, new) {
                    (Some(o), Some(n)) if o == n => continue,
                    (Some(_), Some(_)) => ChangeKind::Modified,
                    (Some(_), None) => ChangeKind::Removed,
                    (None, Some(_)) => ChangeKind::Added,
                    (None, None) => continue,
                };
                changes.push(ValueChange {
                    kind,
                    key: ChangeKey::Field(name.clone()),
                    old: old.cloned(),
                    new: new.cloned(),
                });
            }
            changes
        }
        _ if old == new => Vec::new(),
        _ => vec![ValueChange {
            kind: ChangeKind::Modified,
            key: ChangeKey::Root,
            old: Some(old.clone()),
            new: Some(new.clone()),
        }],
    };

    let produced = match resume {
        None => 0,
        Some(DiffResume::Count(count)) => *count,
        Some(other) => return Err(resume_mismatch(other, old.kind())),
    };
    changes.drain(..produced.min(changes.len()));
    Ok(ValueDiff {
        inner: ValueDiffInner::Eager {
            changes: changes.into_iter(),
            produced,
        },
        last: resume.cloned(),
    })
}

fn decode_change(event: DiffEvent, kind: Kind) -> Result<ValueChange> {
    let change_kind = match &event {
        DiffEvent::Added(_) => ChangeKind::Added,
        DiffEvent::Removed(_) => ChangeKind::Removed,
        DiffEvent::Modified(_) => ChangeKind::Modified,
    };
    let key = decode_item(event.key())?;
    if kind == Kind::Set {
        // Membership changes: the member itself is the old or new value.
        let (old, new) = match change_kind {
            ChangeKind::Added => (None, Some(key.clone())),
            _ => (Some(key.clone()), None),
        };
        return Ok(ValueChange {
            kind: change_kind,
            key: ChangeKey::Key(key),
            old,
            new,
        });
    }
    Ok(ValueChange {
        kind: change_kind,
        key: ChangeKey::Key(key),
        old: event.old_value().map(decode_item).transpose()?,
        new: event.new_value().map(decode_item).transpose()?,
    })
}

/// The `k`th element change of a splice and the resume point after it.
fn splice_change(splice: &Splice, k: usize) -> Option<Result<(ValueChange, DiffResume)>> {
    let removed = splice.removed.len();
    let added = splice.added.len();
    let paired = removed.min(added);
    if k >= removed.max(added) {
        return None;
    }
    let step = k as u64 + 1;
    let (kind, index, resume) = if k < paired {
        (ChangeKind::Modified, splice.at + k as u64, (splice.at + step, splice.new_at + step))
    } else if k < removed {
        (ChangeKind::Removed, splice.at + k as u64, (splice.at + step, splice.new_at + paired as u64))
    } else {
        (ChangeKind::Added, splice.new_at + k as u64, (splice.at + removed as u64, splice.new_at + step))
    };
    let decode = |item: Option<&Vec<u8>>| item.map(|bytes| decode_item(bytes)).transpose();
    let change = decode(splice.removed.get(k)).and_then(|old| {
        Ok(ValueChange {
            kind,
            key: ChangeKey::Index(index),
            old,
            new: decode(splice.added.get(k))?,
        })
    });
    Some(change.map(|change| {
        (
            change,
            DiffResume::Index {
                old: resume.0,
                new: resume.1,
            },
        )
    }))
}

impl<'a> Iterator for ValueDiff<'a> {
    type Item = Result<ValueChange>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            ValueDiffInner::Keyed { events, kind } => {
                let kind = *kind;
                let event = match events.next()? {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                };
                self.last = Some(DiffResume::Key(Arc::from(event.key())));
                Some(decode_change(event, kind))
            }
            ValueDiffInner::List {
                splices,
                current,
                offset,
            } => loop {
                if let Some(splice) = current.as_ref() {
                    match splice_change(splice, *offset) {
                        Some(Ok((change, resume))) => {
                            *offset += 1;
                            self.last = Some(resume);
                            return Some(Ok(change));
                        }
                        Some(Err(err)) => {
                            *current = None;
                            return Some(Err(err));
                        }
                        None => *current = None,
                    }
                }
                match splices.next()? {
                    Ok(splice) => {
                        *current = Some(splice);
                        *offset = 0;
                    }
                    Err(err) => return Some(Err(err)),
                }
            },
            ValueDiffInner::Eager { changes, produced } => {
                let change = changes.next()?;
                *produced += 1;
                self.last = Some(DiffResume::Count(*produced));
                Some(Ok(change))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_item;
    use crate::collection::{ListEdit, MapEdit};
    use crate::config::ChunkConfig;
    use crate::store::MemoryChunkStore;
    use crate::tree::{Edit, ProllyTree};
    use crate::value::{List, Map, Struct};

    fn setup() -> (Arc<MemoryChunkStore>, ProllyTree) {
        let store = Arc::new(MemoryChunkStore::new());
        let tree = ProllyTree::new(store.clone(), ChunkConfig::with_pattern(0.02));
        (store, tree)
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key{:06}", i).into_bytes()
    }

    fn pairs(n: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..n).map(|i| (key(i), format!("v{}", i).into_bytes())).collect()
    }

    fn diff_roots<'a>(store: &'a MemoryChunkStore, tree: &ProllyTree, old: &Ref, new: &Ref) -> DiffIterator<'a> {
        DiffIterator::new(
            store,
            (tree.load_root(old).unwrap(), Some(*old)),
            (tree.load_root(new).unwrap(), Some(*new)),
        )
        .unwrap()
    }

    #[test]
    fn test_diff_identical_trees() {
        let (store, mut tree) = setup();
        let root = tree.build_from_pairs(pairs(1000)).unwrap();
        let mut iter = diff_roots(&store, &tree, &root, &root);
        assert!(iter.next().is_none());
        assert_eq!(iter.stats().subtrees_skipped, 1);
        assert_eq!(iter.stats().nodes_read, 0);
    }

    #[test]
    fn test_diff_empty_trees() {
        let (store, mut tree) = setup();
        let a = tree.build(true, Vec::new()).unwrap();
        let b = tree.build(true, Vec::new()).unwrap();
        assert_eq!(diff_roots(&store, &tree, &a, &b).count(), 0);
    }

    #[test]
    fn test_diff_single_insert_is_one_added() {
        let (store, mut tree) = setup();
        let root = tree.build_from_pairs(pairs(10_000)).unwrap();
        let edited = tree
            .edit(&root, vec![Edit::Insert(b"key005000x".to_vec(), b"new".to_vec())])
            .unwrap();

        let mut iter = diff_roots(&store, &tree, &root, &edited);
        let events: Vec<DiffEvent> = (&mut iter).map(|e| e.unwrap()).collect();
        assert_eq!(
            events,
            vec![DiffEvent::Added(Added {
                key: Arc::from(&b"key005000x"[..]),
                value: Arc::from(&b"new"[..]),
            })]
        );

        let stats = iter.stats();
        assert!(stats.subtrees_skipped > 0);
        assert!(stats.items_compared < 1000, "compared {}", stats.items_compared);
    }

    #[test]
    fn test_diff_added_removed_modified() {
        let (store, mut tree) = setup();
        let old = tree
            .build_from_pairs(vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ])
            .unwrap();
        let new = tree
            .build_from_pairs(vec![
                (b"b".to_vec(), b"20".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
                (b"d".to_vec(), b"4".to_vec()),
            ])
            .unwrap();

        let events: Vec<DiffEvent> = diff_roots(&store, &tree, &old, &new).map(|e| e.unwrap()).collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], DiffEvent::Removed(r) if r.key.as_ref() == b"a"));
        assert!(matches!(&events[1], DiffEvent::Modified(m) if m.key.as_ref() == b"b" && m.new_value.as_ref() == b"20"));
        assert!(matches!(&events[2], DiffEvent::Added(a) if a.key.as_ref() == b"d"));
    }

    #[test]
    fn test_diff_against_different_height() {
        let (store, mut tree) = setup();
        let small = tree.build_from_pairs(pairs(3)).unwrap();
        let large = tree.build_from_pairs(pairs(2000)).unwrap();
        assert_eq!(tree.load_root(&small).unwrap().level, 0);
        assert!(tree.load_root(&large).unwrap().level > 0);

        let added = diff_roots(&store, &tree, &small, &large)
            .map(|e| e.unwrap())
            .filter(|e| matches!(e, DiffEvent::Added(_)))
            .count();
        assert_eq!(added, 1997);
    }

    #[test]
    fn test_diff_resume_after_last_key() {
        let (store, mut tree) = setup();
        let old = tree.build_from_pairs(pairs(500)).unwrap();
        let edits = (0..500).step_by(50).map(|i| Edit::Update(key(i), b"x".to_vec())).collect();
        let new = tree.edit(&old, edits).unwrap();

        let mut iter = diff_roots(&store, &tree, &old, &new);
        let first: Vec<DiffEvent> = (&mut iter).take(4).map(|e| e.unwrap()).collect();
        let last = iter.last_key().unwrap().clone();
        drop(iter);

        let rest: Vec<DiffEvent> = DiffIterator::starting_after(
            store.as_ref(),
            (tree.load_root(&old).unwrap(), Some(old)),
            (tree.load_root(&new).unwrap(), Some(new)),
            Some(&last),
        )
        .unwrap()
        .map(|e| e.unwrap())
        .collect();

        assert_eq!(first.len(), 4);
        assert_eq!(rest.len(), 6);
        assert_eq!(rest[0].key(), key(200).as_slice());
    }

    #[test]
    fn test_keyed_diff_rejects_lists() {
        let (store, mut tree) = setup();
        let list = tree.build_list(vec![b"a".to_vec(), b"b".to_vec()]).unwrap();
        let map = tree.build_from_pairs(pairs(3)).unwrap();
        let result = DiffIterator::new(
            store.as_ref(),
            (tree.load_root(&list).unwrap(), Some(list)),
            (tree.load_root(&map).unwrap(), Some(map)),
        );
        assert!(matches!(result, Err(Error::InvalidEdit(_))));

        let result = ListDiff::new(
            store.as_ref(),
            (tree.load_root(&list).unwrap(), Some(list)),
            (tree.load_root(&map).unwrap(), Some(map)),
        );
        assert!(matches!(result, Err(Error::InvalidEdit(_))));
    }

    fn items(values: &[&str]) -> Vec<Vec<u8>> {
        values.iter().map(|v| v.as_bytes().to_vec()).collect()
    }

    #[test]
    fn test_calc_splices() {
        let old = items(&["a", "b", "c", "d"]);
        let new = items(&["a", "x", "c", "d", "e"]);
        assert_eq!(
            calc_splices(10, 10, &old, &new, MAX_SPLICE_MATRIX),
            vec![
                Splice {
                    at: 11,
                    new_at: 11,
                    removed: items(&["b"]),
                    added: items(&["x"]),
                },
                Splice {
                    at: 14,
                    new_at: 14,
                    removed: Vec::new(),
                    added: items(&["e"]),
                },
            ]
        );

        assert!(calc_splices(0, 0, &old, &old, MAX_SPLICE_MATRIX).is_empty());

        // Over the matrix limit the trimmed middle is one splice.
        let old = items(&["a", "b", "c", "d", "z"]);
        let new = items(&["a", "d", "c", "b", "z"]);
        assert_eq!(
            calc_splices(0, 0, &old, &new, 4),
            vec![Splice {
                at: 1,
                new_at: 1,
                removed: items(&["b", "c", "d"]),
                added: items(&["d", "c", "b"]),
            }]
        );
    }

    fn value_store() -> ValueStore {
        ValueStore::new(Arc::new(MemoryChunkStore::new()), ChunkConfig::with_pattern(0.05))
    }

    fn encoded(value: impl Into<Value>) -> Vec<u8> {
        encode_item(&value.into()).unwrap()
    }

    fn splices(vs: &ValueStore, old: &List, new: &List) -> Vec<Splice> {
        diff_lists(vs, old.sequence(), new.sequence())
            .unwrap()
            .map(|s| s.unwrap())
            .collect()
    }

    #[test]
    fn test_list_diff_front_insert_is_one_splice() {
        let vs = value_store();
        let base = List::from_values(&vs, (0..5000i64).map(Value::from)).unwrap();
        let edited = base.edit(&vs, vec![ListEdit::insert(0, vec![Value::from(-1i64)])]).unwrap();

        let mut diff = diff_lists(&vs, base.sequence(), edited.sequence()).unwrap();
        let found: Vec<Splice> = (&mut diff).map(|s| s.unwrap()).collect();
        assert_eq!(
            found,
            vec![Splice {
                at: 0,
                new_at: 0,
                removed: Vec::new(),
                added: vec![encoded(-1i64)],
            }]
        );
        let stats = diff.stats();
        assert!(stats.subtrees_skipped > 0);
        assert!(stats.items_compared < 1000, "compared {}", stats.items_compared);
    }

    #[test]
    fn test_list_diff_matches_edits() {
        let vs = value_store();
        let base = List::from_values(&vs, (0..5000i64).map(Value::from)).unwrap();
        let inserted: Vec<Value> = (0..5).map(|i| Value::from(format!("new{}", i))).collect();
        let edited = base
            .edit(
                &vs,
                vec![
                    ListEdit::remove(1000, 100),
                    ListEdit::insert(3000, inserted.clone()),
                    ListEdit::set(4000, Value::from("x")),
                ],
            )
            .unwrap();

        assert_eq!(
            splices(&vs, &base, &edited),
            vec![
                Splice {
                    at: 1000,
                    new_at: 1000,
                    removed: (1000..1100i64).map(encoded).collect(),
                    added: Vec::new(),
                },
                Splice {
                    at: 3000,
                    new_at: 2900,
                    removed: Vec::new(),
                    added: inserted.into_iter().map(encoded).collect(),
                },
                Splice {
                    at: 4000,
                    new_at: 3905,
                    removed: vec![encoded(4000i64)],
                    added: vec![encoded("x")],
                },
            ]
        );
        assert!(splices(&vs, &base, &base).is_empty());
    }

    #[test]
    fn test_list_diff_resume() {
        let vs = value_store();
        let base = List::from_values(&vs, (0..2000i64).map(Value::from)).unwrap();
        let edited = base
            .edit(
                &vs,
                vec![
                    ListEdit::insert(10, vec![Value::from("a")]),
                    ListEdit::remove(900, 3),
                    ListEdit::set(1500, Value::from("b")),
                ],
            )
            .unwrap();
        let all = splices(&vs, &base, &edited);
        assert_eq!(all.len(), 3);

        let mut diff = diff_lists(&vs, base.sequence(), edited.sequence()).unwrap();
        diff.next().unwrap().unwrap();
        let (old_index, new_index) = diff.resume_point();
        assert_eq!((old_index, new_index), (10, 11));
        drop(diff);

        let rest: Vec<Splice> = ListDiff::starting_at(
            vs.chunks().as_ref(),
            vs.sequence_root(base.sequence()).unwrap(),
            vs.sequence_root(edited.sequence()).unwrap(),
            old_index,
            new_index,
        )
        .unwrap()
        .map(|s| s.unwrap())
        .collect();
        assert_eq!(rest, all[1..].to_vec());
    }

    #[test]
    fn test_value_diff_maps() {
        let vs = value_store();
        let base = Map::from_entries(&vs, (0..300i64).map(|i| (Value::from(i), Value::from("v")))).unwrap();
        let edited = base
            .edit(
                &vs,
                vec![
                    MapEdit::Update(Value::from(7i64), Value::from("w")),
                    MapEdit::Insert(Value::from(1000i64), Value::from("new")),
                ],
            )
            .unwrap();

        let changes: Vec<ValueChange> = diff_values(&vs, &Value::Map(base), &Value::Map(edited))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&ValueChange {
            kind: ChangeKind::Modified,
            key: ChangeKey::Key(Value::from(7i64)),
            old: Some(Value::from("v")),
            new: Some(Value::from("w")),
        }));
        assert!(changes.contains(&ValueChange {
            kind: ChangeKind::Added,
            key: ChangeKey::Key(Value::from(1000i64)),
            old: None,
            new: Some(Value::from("new")),
        }));
    }

    #[test]
    fn test_value_diff_lists_use_splices() {
        let vs = value_store();
        let base = List::from_values(&vs, (0..5i64).map(Value::from)).unwrap();
        let edited = base
            .edit(&vs, vec![ListEdit::set(1, Value::from("one")), ListEdit::insert(5, vec![Value::from(5i64)])])
            .unwrap();
        let changes: Vec<ValueChange> = diff_values(&vs, &Value::List(base), &Value::List(edited))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key, ChangeKey::Index(1));
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[1].key, ChangeKey::Index(5));
        assert_eq!(changes[1].kind, ChangeKind::Added);

        let long = List::from_values(&vs, (0..5000i64).map(Value::from)).unwrap();
        let shifted = long.edit(&vs, vec![ListEdit::insert(0, vec![Value::from(-1i64)])]).unwrap();
        let changes: Vec<ValueChange> = diff_values(&vs, &Value::List(long), &Value::List(shifted))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(
            changes,
            vec![ValueChange {
                kind: ChangeKind::Added,
                key: ChangeKey::Index(0),
                old: None,
                new: Some(Value::from(-1i64)),
            }]
        );
    }

    #[test]
    fn test_value_diff_resume() {
        let vs = value_store();
        let base = Map::from_entries(&vs, (0..300i64).map(|i| (Value::from(i), Value::from("v")))).unwrap();
        let edits = (0..300i64).step_by(30).map(|i| MapEdit::Update(Value::from(i), Value::from("w"))).collect();
        let edited = base.edit(&vs, edits).unwrap();
        let (old, new) = (Value::Map(base), Value::Map(edited));

        let all: Vec<ValueChange> = diff_values(&vs, &old, &new).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(all.len(), 10);

        let mut diff = diff_values(&vs, &old, &new).unwrap();
        assert!(diff.last_key().is_none());
        let first: Vec<ValueChange> = (&mut diff).take(3).map(|c| c.unwrap()).collect();
        let resume = diff.last_key().unwrap().clone();
        assert!(matches!(resume, DiffResume::Key(_)));
        let rest: Vec<ValueChange> = ValueDiff::starting_after(&vs, &old, &new, &resume)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(first, all[..3].to_vec());
        assert_eq!(rest, all[3..].to_vec());

        // Resuming in the middle of a list splice picks up the next element.
        let list = List::from_values(&vs, (0..10i64).map(Value::from)).unwrap();
        let removed = list.edit(&vs, vec![ListEdit::remove(2, 3)]).unwrap();
        let (old, new) = (Value::List(list), Value::List(removed));
        let mut diff = diff_values(&vs, &old, &new).unwrap();
        diff.next().unwrap().unwrap();
        let resume = diff.last_key().unwrap().clone();
        assert_eq!(resume, DiffResume::Index { old: 3, new: 2 });
        let rest: Vec<ChangeKey> = ValueDiff::starting_after(&vs, &old, &new, &resume)
            .unwrap()
            .map(|c| c.unwrap().key)
            .collect();
        assert_eq!(rest, vec![ChangeKey::Index(3), ChangeKey::Index(4)]);

        let wrong = ValueDiff::starting_after(&vs, &old, &new, &DiffResume::Count(1));
        assert!(matches!(wrong, Err(Error::InvalidEdit(_))));
    }

    #[test]
    fn test_value_diff_structs_and_primitives() {
        let vs = value_store();
        let a = Value::Struct(Struct::new("P").with("x", 1i64).with("y", 2i64));
        let b = Value::Struct(Struct::new("P").with("x", 1i64).with("z", 3i64));
        let changes: Vec<ValueChange> = diff_values(&vs, &a, &b).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(
            changes.iter().map(|c| (c.key.clone(), c.kind)).collect::<Vec<_>>(),
            vec![
                (ChangeKey::Field("y".into()), ChangeKind::Removed),
                (ChangeKey::Field("z".into()), ChangeKind::Added),
            ]
        );
        let mut diff = diff_values(&vs, &a, &b).unwrap();
        diff.next().unwrap().unwrap();
        let resume = diff.last_key().unwrap().clone();
        assert_eq!(resume, DiffResume::Count(1));
        let rest: Vec<ValueChange> = ValueDiff::starting_after(&vs, &a, &b, &resume)
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(rest, changes[1..].to_vec());

        assert_eq!(diff_values(&vs, &Value::from(1i64), &Value::from(1i64)).unwrap().count(), 0);
        let root: Vec<ValueChange> = diff_values(&vs, &Value::from(1i64), &Value::from("1"))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(root[0].key, ChangeKey::Root);
    }
}
