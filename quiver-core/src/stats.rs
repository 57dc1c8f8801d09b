//! Size statistics for chunks written by a store.
//!
//! Sizes are grouped into power-of-two classes, which is enough to see
//! whether the chunker is producing nodes near the target size.

use tracing::info;

use crate::codec::ChunkKind;

const SIZE_CLASSES: usize = usize::BITS as usize + 1;

/// Size distribution of one kind of chunk.
#[derive(Debug, Clone)]
pub struct Histogram {
    pub name: &'static str,
    /// `classes[0]` counts empty chunks, `classes[k]` counts sizes in
    /// `2^(k-1) ..= 2^k - 1`.
    classes: [usize; SIZE_CLASSES],
    pub chunks: usize,
    pub bytes: usize,
    pub largest: usize,
}

fn size_class(size: usize) -> usize {
    (usize::BITS - size.leading_zeros()) as usize
}

impl Histogram {
    pub fn new(name: &'static str) -> Self {
        Histogram {
            name,
            classes: [0; SIZE_CLASSES],
            chunks: 0,
            bytes: 0,
            largest: 0,
        }
    }

    pub fn record(&mut self, size: usize) {
        self.classes[size_class(size)] += 1;
        self.chunks += 1;
        self.bytes += size;
        self.largest = self.largest.max(size);
    }

    pub fn average(&self) -> f64 {
        if self.chunks == 0 {
            return 0.0;
        }
        self.bytes as f64 / self.chunks as f64
    }

    /// Non-empty classes as `(smallest, largest, count)`, smallest sizes first.
    pub fn classes(&self) -> Vec<(usize, usize, usize)> {
        self.classes
            .iter()
            .enumerate()
            .filter(|&(_, &count)| count > 0)
            .map(|(k, &count)| match k {
                0 => (0, 0, count),
                k => (1usize << (k - 1), usize::MAX >> (usize::BITS as usize - k), count),
            })
            .collect()
    }

    pub fn log_distribution(&self) {
        if self.chunks == 0 {
            return;
        }
        info!(
            kind = self.name,
            chunks = self.chunks,
            bytes = self.bytes,
            avg_bytes = self.average(),
            largest = self.largest,
            "chunk sizes"
        );
        for (low, high, count) in self.classes() {
            info!(
                kind = self.name,
                "{:>8}..={:<8} {:>8} ({:>5.1}%)",
                low,
                high,
                count,
                count as f64 * 100.0 / self.chunks as f64
            );
        }
    }
}

/// Per-kind size histograms of chunks a store has accepted.
#[derive(Debug, Clone)]
pub struct Stats {
    pub values: Histogram,
    pub nodes: Histogram,
    /// Chunks without a recognised header, e.g. raw blobs.
    pub opaque: Histogram,
}

impl Stats {
    pub fn new() -> Self {
        Stats {
            values: Histogram::new("value"),
            nodes: Histogram::new("sequence node"),
            opaque: Histogram::new("opaque"),
        }
    }

    /// Record a chunk by peeking at its header.
    pub fn record_chunk(&mut self, data: &[u8]) {
        let histogram = match ChunkKind::peek(data) {
            Some(ChunkKind::Value) => &mut self.values,
            Some(ChunkKind::SequenceNode) => &mut self.nodes,
            None => &mut self.opaque,
        };
        histogram.record(data.len());
    }

    pub fn total_chunks(&self) -> usize {
        self.values.chunks + self.nodes.chunks + self.opaque.chunks
    }

    pub fn total_bytes(&self) -> usize {
        self.values.bytes + self.nodes.bytes + self.opaque.bytes
    }

    pub fn log_distributions(&self) {
        for histogram in [&self.values, &self.nodes, &self.opaque] {
            histogram.log_distribution();
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}
