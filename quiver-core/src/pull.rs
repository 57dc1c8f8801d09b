//! Copying a chunk graph from one store to another.
//!
//! A pull walks the graph below a root depth first and stops at every chunk
//! the destination already has. Chunks are written children first, so any
//! chunk present in a store has its whole graph present too, and an
//! interrupted pull leaves the destination consistent. After a small edit only
//! the chunks on the changed paths are copied.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::codec::chunk_refs;
use crate::error::Result;
use crate::hash::{Chunk, Ref};
use crate::store::ChunkStore;

/// Chunks buffered before they are written to the destination.
const WRITE_BATCH: usize = 256;

/// Statistics from a pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullStats {
    pub chunks_copied: usize,
    pub bytes_copied: usize,
    /// Chunks found in the destination already; their graphs were not walked.
    pub chunks_present: usize,
}

enum Visit {
    Enter(Ref),
    /// Every child has been written
    Leave(Chunk),
}

/// Copy every chunk reachable from `root` that `dst` lacks from `src`.
///
/// A chunk missing from `src` is [`crate::Error::NotFound`].
pub fn pull(src: &dyn ChunkStore, dst: &dyn ChunkStore, root: &Ref) -> Result<PullStats> {
    let mut stats = PullStats::default();
    let mut seen = HashSet::new();
    let mut pending: Vec<Chunk> = Vec::new();
    let mut stack = vec![Visit::Enter(*root)];

    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(hash) => {
                if !seen.insert(hash) {
                    continue;
                }
                if dst.has(&hash)? {
                    stats.chunks_present += 1;
                    continue;
                }
                let chunk = src.get_required(&hash)?;
                let children = chunk_refs(chunk.data())?;
                stack.push(Visit::Leave(chunk));
                stack.extend(
                    children
                        .into_iter()
                        .filter(|child| !seen.contains(child))
                        .map(Visit::Enter),
                );
            }
            Visit::Leave(chunk) => {
                stats.chunks_copied += 1;
                stats.bytes_copied += chunk.data().len();
                pending.push(chunk);
                if pending.len() >= WRITE_BATCH {
                    debug!(chunks = pending.len(), "writing pulled chunks");
                    dst.put_many(&pending)?;
                    pending.clear();
                }
            }
        }
    }
    if !pending.is_empty() {
        dst.put_many(&pending)?;
    }

    info!(
        root = %root.short(),
        copied = stats.chunks_copied,
        bytes = stats.bytes_copied,
        present = stats.chunks_present,
        "pulled chunk graph"
    );
    Ok(stats)
}
