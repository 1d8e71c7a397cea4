//! Block geometry and range math.
//!
//! Byte ranges requested by callers are widened to block boundaries, and the
//! blocks inside that widened span that are not yet present are grouped into
//! maximal contiguous runs. Each run becomes exactly one fetch call.

use std::ops::Range;

/// A half-open interval of block indices `[first, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSpan {
    pub first: u64,
    pub end: u64,
}

impl BlockSpan {
    pub fn new(first: u64, end: u64) -> Self {
        debug_assert!(first <= end);
        Self { first, end }
    }

    /// Number of blocks in the span.
    pub fn len(&self) -> u64 {
        self.end - self.first
    }

    pub fn is_empty(&self) -> bool {
        self.first == self.end
    }

    /// Whether two spans share at least one block.
    pub fn overlaps(&self, other: &BlockSpan) -> bool {
        self.first < other.end && other.first < self.end
    }

    /// Iterate over the block indices in the span.
    pub fn blocks(&self) -> Range<u64> {
        self.first..self.end
    }
}

impl std::fmt::Display for BlockSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blocks [{}, {})", self.first, self.end)
    }
}

/// Fixed geometry of a cached resource: total length and bytes per block.
///
/// Both values are fixed when the cache is created. The last block may be
/// shorter than `block_size` when `total_size` is not a multiple of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGeometry {
    total_size: u64,
    block_size: u64,
}

impl BlockGeometry {
    /// Create a geometry. `block_size` must be non-zero.
    pub fn new(total_size: u64, block_size: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            total_size,
            block_size,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Number of blocks needed to cover the whole resource.
    pub fn block_count(&self) -> u64 {
        self.total_size.div_ceil(self.block_size)
    }

    /// Blocks touched by the byte range `[start, end)`.
    ///
    /// An empty byte range maps to an empty span.
    pub fn span_for(&self, start: u64, end: u64) -> BlockSpan {
        if start >= end {
            let first = start / self.block_size;
            return BlockSpan::new(first, first);
        }
        BlockSpan::new(start / self.block_size, end.div_ceil(self.block_size))
    }

    /// Byte bounds of a block span, clamped to the end of the resource.
    pub fn byte_range(&self, span: BlockSpan) -> Range<u64> {
        let start = (span.first * self.block_size).min(self.total_size);
        let end = (span.end * self.block_size).min(self.total_size);
        start..end
    }

    /// `[start, end)` rounded outward to block boundaries.
    #[cfg(test)]
    fn aligned(&self, start: u64, end: u64) -> Range<u64> {
        self.byte_range(self.span_for(start, end))
    }
}

/// Split `span` into maximal runs of blocks for which `is_present` is false.
///
/// Adjacent missing blocks are merged into one run; a present block ends the
/// current run. Present blocks never appear in the output.
pub fn missing_runs(span: BlockSpan, mut is_present: impl FnMut(u64) -> bool) -> Vec<BlockSpan> {
    let mut runs = Vec::new();
    let mut run_start: Option<u64> = None;

    for block in span.blocks() {
        match (is_present(block), run_start) {
            (false, None) => run_start = Some(block),
            (true, Some(first)) => {
                runs.push(BlockSpan::new(first, block));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(first) = run_start {
        runs.push(BlockSpan::new(first, span.end));
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outward_rounding() {
        let geo = BlockGeometry::new(65536, 1024);
        assert_eq!(geo.aligned(0, 256), 0..1024);
        assert_eq!(geo.aligned(45, 600), 0..1024);
        assert_eq!(geo.aligned(2100, 4100), 2048..5120);
        assert_eq!(geo.aligned(2200, 4200), 2048..5120);
        assert_eq!(geo.aligned(1024, 2048), 1024..2048);
    }

    #[test]
    fn test_partial_last_block() {
        let geo = BlockGeometry::new(2500, 1024);
        assert_eq!(geo.block_count(), 3);
        assert_eq!(geo.aligned(2100, 2500), 2048..2500);
        assert_eq!(geo.byte_range(BlockSpan::new(0, 3)), 0..2500);
    }

    #[test]
    fn test_empty_range_has_empty_span() {
        let geo = BlockGeometry::new(4096, 1024);
        assert!(geo.span_for(300, 300).is_empty());
        assert!(geo.span_for(4096, 4096).is_empty());
    }

    #[test]
    fn test_missing_runs_coalesce() {
        let runs = missing_runs(BlockSpan::new(0, 4), |_| false);
        assert_eq!(runs, vec![BlockSpan::new(0, 4)]);
    }

    #[test]
    fn test_missing_runs_split_on_present_block() {
        let runs = missing_runs(BlockSpan::new(0, 5), |b| b == 2);
        assert_eq!(runs, vec![BlockSpan::new(0, 2), BlockSpan::new(3, 5)]);

        let runs = missing_runs(BlockSpan::new(0, 5), |b| b == 0 || b == 4);
        assert_eq!(runs, vec![BlockSpan::new(1, 4)]);
    }

    #[test]
    fn test_missing_runs_all_present() {
        assert!(missing_runs(BlockSpan::new(3, 9), |_| true).is_empty());
    }

    #[test]
    fn test_span_overlap() {
        let a = BlockSpan::new(0, 3);
        assert!(a.overlaps(&BlockSpan::new(2, 5)));
        assert!(!a.overlaps(&BlockSpan::new(3, 5)));
        assert!(!a.overlaps(&BlockSpan::new(1, 1)));
    }
}
