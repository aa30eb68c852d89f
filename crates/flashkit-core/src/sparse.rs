//! Sparse writes driven by a block map
//!
//! A [`BlockMap`] lists the ranges of an image that hold data. Everything
//! outside those ranges is known to be zero and can be skipped on write.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::stage::Stage;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Occupied regions of an image, in units of `block_size`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    block_size: u64,
    ranges: Vec<RangeInclusive<u64>>,
}

impl BlockMap {
    /// Build a map from inclusive block ranges
    ///
    /// Ranges must be sorted, non-overlapping and have `first <= last`.
    pub fn new(block_size: u64, ranges: Vec<RangeInclusive<u64>>) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig(
                "Block map block size must be greater than zero".to_string(),
            ));
        }

        for (i, range) in ranges.iter().enumerate() {
            if range.start() > range.end() {
                return Err(Error::InvalidConfig(format!(
                    "Block map range {}-{} is reversed",
                    range.start(),
                    range.end()
                )));
            }
            if let Some(prev) = i.checked_sub(1).map(|p| &ranges[p]) {
                if range.start() <= prev.end() {
                    return Err(Error::InvalidConfig(format!(
                        "Block map range {}-{} overlaps or precedes {}-{}",
                        range.start(),
                        range.end(),
                        prev.start(),
                        prev.end()
                    )));
                }
            }
        }

        Ok(Self { block_size, ranges })
    }

    /// Block size the ranges are expressed in
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Mapped ranges
    pub fn ranges(&self) -> &[RangeInclusive<u64>] {
        &self.ranges
    }

    /// Number of mapped blocks
    pub fn mapped_blocks(&self) -> u64 {
        self.ranges.iter().map(|r| r.end() - r.start() + 1).sum()
    }

    /// Number of mapped bytes
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_blocks() * self.block_size
    }

    /// Whether any byte of `start..end` falls inside a mapped range
    pub fn is_mapped(&self, start: u64, end: u64) -> bool {
        if end <= start {
            return false;
        }
        let first = start / self.block_size;
        let last = (end - 1) / self.block_size;

        let idx = self.ranges.partition_point(|r| *r.end() < first);
        self.ranges
            .get(idx)
            .is_some_and(|r| *r.start() <= last)
    }

    /// Stage that drops unmapped blocks and addresses the rest
    pub fn filter_stage(self: &Arc<Self>, block_size: usize) -> SparseFilter {
        SparseFilter {
            map: Arc::clone(self),
            block_size,
            next_address: 0,
            skipped: 0,
        }
    }
}

/// Drops blocks that fall outside a [`BlockMap`]
pub struct SparseFilter {
    map: Arc<BlockMap>,
    block_size: usize,
    next_address: u64,
    skipped: u64,
}

impl SparseFilter {
    /// Blocks dropped so far
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl Stage for SparseFilter {
    fn name(&self) -> &'static str {
        "sparse-filter"
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        if block.len() != self.block_size {
            return Err(Error::upstream(
                "sparse-filter",
                format!(
                    "Expected {}-byte block, got {} bytes",
                    self.block_size,
                    block.len()
                ),
            ));
        }

        let address = self.next_address;
        self.next_address += 1;

        let start = address * self.block_size as u64;
        if self.map.is_mapped(start, start + self.block_size as u64) {
            out.push(Block::addressed(block.data, address, self.block_size));
        } else {
            self.skipped += 1;
        }
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Block>) -> Result<()> {
        tracing::debug!(
            "Sparse filter skipped {} of {} blocks",
            self.skipped,
            self.next_address
        );
        Ok(())
    }
}
