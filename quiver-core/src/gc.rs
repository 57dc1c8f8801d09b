//! Mark-and-sweep garbage collection.
//!
//! Everything reachable from a dataset head survives: the commit, its parents
//! all the way back, each commit's value, and every chunk those values point
//! at. Candidates are listed before the heads are read, so a chunk written
//! while a collection runs is never a candidate and cannot be swept.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::codec::chunk_refs;
use crate::dataset::DatasetStore;
use crate::error::Result;
use crate::hash::Ref;
use crate::store::ChunkStore;

/// Statistics from a garbage collection run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcStats {
    pub total_chunks: usize,
    pub reachable_chunks: usize,
    pub garbage_chunks: usize,
    /// Chunks actually deleted; zero on a dry run.
    pub removed: usize,
}

impl GcStats {
    pub fn reachable_percent(&self) -> f64 {
        percent(self.reachable_chunks, self.total_chunks)
    }

    pub fn garbage_percent(&self) -> f64 {
        percent(self.garbage_chunks, self.total_chunks)
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}

/// Every stored chunk reachable from `roots`, roots included.
///
/// Refs that point at missing chunks are skipped.
pub fn find_reachable(store: &dyn ChunkStore, roots: impl IntoIterator<Item = Ref>) -> Result<HashSet<Ref>> {
    let mut reachable = HashSet::new();
    let mut to_visit: Vec<Ref> = roots.into_iter().collect();

    while let Some(hash) = to_visit.pop() {
        if reachable.contains(&hash) {
            continue;
        }
        let chunk = match store.get(&hash)? {
            Some(chunk) => chunk,
            None => {
                warn!(chunk = %hash.short(), "reachable ref points at a missing chunk");
                continue;
            }
        };
        reachable.insert(hash);
        to_visit.extend(
            chunk_refs(chunk.data())?
                .into_iter()
                .filter(|child| !reachable.contains(child)),
        );
    }

    Ok(reachable)
}

/// Delete every chunk not reachable from a dataset head.
///
/// With `dry_run` nothing is deleted and `removed` stays zero.
pub fn collect_garbage(store: &dyn ChunkStore, datasets: &dyn DatasetStore, dry_run: bool) -> Result<GcStats> {
    let candidates = store.list()?;
    let heads = datasets.list()?;
    debug!(candidates = candidates.len(), heads = heads.len(), "starting garbage collection");

    let reachable = find_reachable(store, heads.into_values())?;
    let garbage: Vec<Ref> = candidates
        .iter()
        .filter(|hash| !reachable.contains(hash))
        .copied()
        .collect();

    let mut removed = 0;
    if !dry_run {
        for hash in &garbage {
            if store.delete(hash)? {
                removed += 1;
            }
        }
    }

    let stats = GcStats {
        total_chunks: candidates.len(),
        reachable_chunks: candidates.len() - garbage.len(),
        garbage_chunks: garbage.len(),
        removed,
    };
    info!(
        total = stats.total_chunks,
        reachable = stats.reachable_chunks,
        garbage = stats.garbage_chunks,
        removed = stats.removed,
        dry_run,
        "garbage collection finished"
    );
    Ok(stats)
}
