//! Fixed-size rechunking of an arbitrary byte stream

use crate::block::Block;
use crate::error::{Error, Result};
use crate::stage::Stage;

/// Splits incoming chunks into blocks of exactly `block_size` bytes
///
/// The final partial block is zero-padded on flush. A chunk that is exactly
/// one block long while nothing is buffered is forwarded without copying.
#[derive(Debug)]
pub struct Blocker {
    block_size: usize,
    leftover: Vec<u8>,
}

impl Blocker {
    /// Create a blocker for the given block size
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig(
                "Block size must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            block_size,
            leftover: Vec::new(),
        })
    }

    /// Configured block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Bytes held back waiting for a full block
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }
}

impl Stage for Blocker {
    fn name(&self) -> &'static str {
        "blocker"
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        let bs = self.block_size;

        if self.leftover.is_empty() && block.data.len() == bs {
            out.push(Block::raw(block.data));
            return Ok(());
        }

        self.leftover.extend_from_slice(&block.data);

        let full = self.leftover.len() / bs * bs;
        if full == 0 {
            return Ok(());
        }

        let rest = self.leftover.split_off(full);
        let ready = std::mem::replace(&mut self.leftover, rest);
        out.extend(ready.chunks_exact(bs).map(|c| Block::raw(c.to_vec())));
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<Block>) -> Result<()> {
        if self.leftover.is_empty() {
            return Ok(());
        }

        let mut last = std::mem::take(&mut self.leftover);
        tracing::debug!(
            "Padding final block: {} data bytes, {} zero bytes",
            last.len(),
            self.block_size - last.len()
        );
        last.resize(self.block_size, 0);
        out.push(Block::raw(last));
        Ok(())
    }
}
