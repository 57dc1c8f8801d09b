//! Commit graph operations.
//!
//! Commits are immutable values addressed by ref, so the graph is an arena:
//! a commit names its parents by ref and nothing ever points back. Walking the
//! graph means reading commits from the value store.
//!
//! ## Ancestor order
//!
//! [`Ancestors`] yields commits by decreasing height; commits of equal height
//! come in the order they were discovered, and parents are discovered in
//! declaration order. Since a commit is always higher than its parents, no
//! commit is produced before one of its descendants in the walk.
//!
//! ## Common ancestor
//!
//! [`common_ancestor`] walks the first commit's ancestors in that order and
//! returns the first one that is also an ancestor of the second. That commit
//! has the greatest height among the common ancestors, so none of them
//! descends from it, and among equally high candidates the one reached through
//! earlier-declared parents wins.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tracing::{debug, info, warn};

use crate::commit::{Commit, CommitMeta};
use crate::dataset::DatasetStore;
use crate::error::{Error, Result};
use crate::hash::Ref;
use crate::value::Kind;
use crate::value_store::ValueStore;

pub fn read_commit(vs: &ValueStore, hash: &Ref) -> Result<Commit> {
    let value = vs.read_value_as(hash, Kind::Struct)?;
    Commit::from_value(vs, &value)
}

/// Create and store a commit.
///
/// Duplicate parents are dropped, keeping the first occurrence. Every parent
/// must exist. Calling this twice with the same arguments returns the same ref.
pub fn commit(vs: &ValueStore, value: &Ref, parents: &[Ref], meta: CommitMeta) -> Result<Ref> {
    let mut seen = HashSet::new();
    let parents: Vec<Ref> = parents.iter().copied().filter(|p| seen.insert(*p)).collect();

    let mut height = 0;
    for parent in &parents {
        height = height.max(read_commit(vs, parent)?.height);
    }

    let commit = Commit {
        value: *value,
        parents,
        meta,
        height: height + 1,
    };
    let hash = vs.write_value(&commit.to_value(vs)?)?;
    debug!(commit = %hash.short(), height = commit.height, parents = commit.parents.len(), "created commit");
    Ok(hash)
}

#[derive(Clone)]
struct Pending {
    height: u64,
    seq: u64,
    hash: Ref,
    commit: Commit,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Max-heap: greatest height first, then earliest discovery.
    fn cmp(&self, other: &Self) -> Ordering {
        self.height
            .cmp(&other.height)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Lazy walk over a commit and its ancestors, each visited once.
///
/// Cloning the iterator saves its position: the clone continues from the
/// same point independently.
#[derive(Clone)]
pub struct Ancestors<'a> {
    vs: &'a ValueStore,
    queue: BinaryHeap<Pending>,
    seen: HashSet<Ref>,
    seq: u64,
    failed: bool,
}

impl<'a> Ancestors<'a> {
    pub fn new(vs: &'a ValueStore, start: &Ref) -> Result<Self> {
        let mut ancestors = Ancestors {
            vs,
            queue: BinaryHeap::new(),
            seen: HashSet::new(),
            seq: 0,
            failed: false,
        };
        ancestors.discover(*start)?;
        Ok(ancestors)
    }

    fn discover(&mut self, hash: Ref) -> Result<()> {
        if !self.seen.insert(hash) {
            return Ok(());
        }
        let commit = read_commit(self.vs, &hash)?;
        self.queue.push(Pending {
            height: commit.height,
            seq: self.seq,
            hash,
            commit,
        });
        self.seq += 1;
        Ok(())
    }

    /// Height of the next commit to be produced.
    pub fn peek_height(&self) -> Option<u64> {
        self.queue.peek().map(|p| p.height)
    }
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = Result<(Ref, Commit)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let pending = self.queue.pop()?;
        for parent in &pending.commit.parents {
            if let Err(err) = self.discover(*parent) {
                self.failed = true;
                return Some(Err(err));
            }
        }
        Some(Ok((pending.hash, pending.commit)))
    }
}

/// `start` followed by all of its ancestors.
pub fn ancestors<'a>(vs: &'a ValueStore, start: &Ref) -> Result<Ancestors<'a>> {
    Ancestors::new(vs, start)
}

/// True if `ancestor` is `descendant` or one of its ancestors.
pub fn is_ancestor(vs: &ValueStore, ancestor: &Ref, descendant: &Ref) -> Result<bool> {
    if ancestor == descendant {
        return Ok(true);
    }
    let target_height = read_commit(vs, ancestor)?.height;
    let mut walk = Ancestors::new(vs, descendant)?;
    loop {
        // Everything left is lower than the target: it cannot be reached.
        match walk.peek_height() {
            Some(height) if height >= target_height => {}
            _ => return Ok(false),
        }
        match walk.next() {
            Some(Ok((hash, _))) if hash == *ancestor => return Ok(true),
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(err),
            None => return Ok(false),
        }
    }
}

/// Lowest common ancestor of two commits, if they share history.
pub fn common_ancestor(vs: &ValueStore, ours: &Ref, theirs: &Ref) -> Result<Option<Ref>> {
    if ours == theirs {
        return Ok(Some(*ours));
    }
    let mut theirs_history = HashSet::new();
    for entry in Ancestors::new(vs, theirs)? {
        theirs_history.insert(entry?.0);
    }
    for entry in Ancestors::new(vs, ours)? {
        let (hash, _) = entry?;
        if theirs_history.contains(&hash) {
            debug!(ours = %ours.short(), theirs = %theirs.short(), base = %hash.short(), "found common ancestor");
            return Ok(Some(hash));
        }
    }
    Ok(None)
}

/// Move a dataset head with optimistic concurrency.
///
/// `update` receives the current head and returns the new one. If another
/// writer moves the head in between, the head is re-read and `update` runs
/// again, at most `max_attempts` times in total. Errors from `update` end the
/// loop immediately.
pub fn update_dataset_with_retry<F>(
    datasets: &dyn DatasetStore,
    name: &str,
    max_attempts: u32,
    mut update: F,
) -> Result<Ref>
where
    F: FnMut(Option<&Ref>) -> Result<Ref>,
{
    for attempt in 1..=max_attempts {
        let head = datasets.head(name)?;
        let new = update(head.as_ref())?;
        if datasets.compare_and_set(name, head.as_ref(), &new)? {
            info!(
                dataset = name,
                from = %head.map(|h| h.short()).unwrap_or_else(|| "-".to_string()),
                to = %new.short(),
                attempt,
                "moved dataset head"
            );
            return Ok(new);
        }
        warn!(dataset = name, attempt, max_attempts, "lost dataset update race, retrying");
    }
    Err(Error::ConcurrentModification {
        dataset: name.to_string(),
        attempts: max_attempts,
    })
}
