//! Coalescing block writer
//!
//! The writer is the sink at the end of a flash pipeline. Unaddressed blocks
//! are written at a running cursor. Addressed blocks that follow each other
//! are gathered into a run and written with a single positional call once the
//! run is broken or reaches `max_run_bytes`.
//!
//! Writes are synchronous, so at most one is in flight and the caller cannot
//! get ahead of the target.

use crate::block::Block;
use crate::config::DEFAULT_MAX_RUN_BYTES;
use crate::error::{Error, Result};
use crate::target::{Target, TargetOpener};
use std::collections::VecDeque;
use std::sync::Arc;

// ============================================================================
// State and stats
// ============================================================================

/// Lifecycle of a [`CoalescingWriter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Waiting for the target to be opened; operations are queued
    Opening,
    /// Accepting blocks
    Ready,
    /// Finished writing; no more blocks accepted
    Flushing,
    /// Releasing the target
    Closing,
    /// Target released after a clean finish or close
    Closed,
    /// Torn down after a failure or an explicit destroy
    Destroyed,
}

impl std::fmt::Display for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WriterState::Opening => "opening",
            WriterState::Ready => "ready",
            WriterState::Flushing => "flushing",
            WriterState::Closing => "closing",
            WriterState::Closed => "closed",
            WriterState::Destroyed => "destroyed",
        };
        write!(f, "{}", name)
    }
}

/// Counters kept by a [`CoalescingWriter`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Bytes accepted from upstream
    pub bytes_read: u64,
    /// Blocks accepted from upstream
    pub blocks_read: u64,
    /// Bytes persisted to the target
    pub bytes_written: u64,
    /// Blocks persisted to the target
    pub blocks_written: u64,
    /// Positional write calls issued
    pub write_calls: u64,
}

/// Where a writer sends its bytes
pub enum Destination {
    /// Opened lazily on [`CoalescingWriter::open`]
    Opener(Arc<dyn TargetOpener>),
    /// Already open; the writer starts `Ready`
    Target(Box<dyn Target>),
}

enum PendingOp {
    Write(Block),
    Close,
    Destroy,
}

/// Contiguous addressed blocks waiting to be written together
struct WriteRun {
    start_position: u64,
    last_address: Option<u64>,
    buffer: Vec<u8>,
    block_count: u64,
}

impl WriteRun {
    fn start(block: Block, position: u64) -> Self {
        Self {
            start_position: position,
            last_address: block.address,
            buffer: block.data,
            block_count: 1,
        }
    }

    fn end_position(&self) -> u64 {
        self.start_position + self.buffer.len() as u64
    }

    fn continues_with(&self, block: &Block) -> bool {
        match (block.address, self.last_address) {
            (Some(address), Some(last)) => address == last + 1,
            _ => block.position == Some(self.end_position()),
        }
    }

    fn append(&mut self, block: Block) {
        self.buffer.extend_from_slice(&block.data);
        self.last_address = block.address;
        self.block_count += 1;
    }
}

type CloseCallback = Box<dyn FnOnce(WriterState) + Send>;

// ============================================================================
// Writer
// ============================================================================

/// Sink that writes blocks to a [`Target`], merging contiguous addressed blocks
pub struct CoalescingWriter {
    state: WriterState,
    opener: Option<Arc<dyn TargetOpener>>,
    target: Option<Box<dyn Target>>,
    run: Option<WriteRun>,
    cursor: u64,
    max_run_bytes: usize,
    auto_close: bool,
    pending: VecDeque<PendingOp>,
    stats: WriterStats,
    on_close: Option<CloseCallback>,
}

impl CoalescingWriter {
    /// Create a writer for `destination`
    pub fn new(destination: Destination) -> Self {
        let (state, opener, target) = match destination {
            Destination::Opener(opener) => (WriterState::Opening, Some(opener), None),
            Destination::Target(target) => (WriterState::Ready, None, Some(target)),
        };

        Self {
            state,
            opener,
            target,
            run: None,
            cursor: 0,
            max_run_bytes: DEFAULT_MAX_RUN_BYTES,
            auto_close: true,
            pending: VecDeque::new(),
            stats: WriterStats::default(),
            on_close: None,
        }
    }

    /// Set the byte count at which a run is flushed
    pub fn max_run_bytes(mut self, bytes: usize) -> Self {
        self.max_run_bytes = bytes.max(1);
        self
    }

    /// Close the target on finish and on failure
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// Called once when the writer reaches `Closed` or `Destroyed`
    pub fn on_close<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(WriterState) + Send + 'static,
    {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Current state
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Offset the next unaddressed block will be written at
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Reclaim a target left open because auto-close is off
    pub fn take_target(&mut self) -> Option<Box<dyn Target>> {
        if self.auto_close {
            return None;
        }
        self.target.take()
    }

    /// Open the target and replay anything queued while opening
    pub fn open(&mut self) -> Result<()> {
        if self.state != WriterState::Opening {
            return Ok(());
        }

        let Some(opener) = self.opener.clone() else {
            return Err(Error::WriterClosed(self.state));
        };

        match opener.open_write() {
            Ok(target) => {
                tracing::debug!("Writer opened {}", opener.path());
                self.target = Some(target);
                self.state = WriterState::Ready;
            }
            Err(e) => {
                self.pending.clear();
                self.teardown(WriterState::Destroyed);
                return Err(e);
            }
        }

        while let Some(op) = self.pending.pop_front() {
            let result = match op {
                PendingOp::Write(block) => self.write(block),
                PendingOp::Close => self.close(),
                PendingOp::Destroy => {
                    self.destroy();
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.pending.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Accept one block
    pub fn write(&mut self, block: Block) -> Result<()> {
        match self.state {
            WriterState::Opening => {
                self.pending.push_back(PendingOp::Write(block));
                return Ok(());
            }
            WriterState::Ready => {}
            state => return Err(Error::WriterClosed(state)),
        }

        self.stats.bytes_read += block.len() as u64;
        self.stats.blocks_read += 1;

        let Some(position) = block.position else {
            self.flush_run()?;
            let offset = self.cursor;
            self.write_target(offset, &block.data, 1)?;
            self.cursor += block.len() as u64;
            return Ok(());
        };

        let max_run_bytes = self.max_run_bytes;
        if let Some(run) = self
            .run
            .as_mut()
            .filter(|run| run.continues_with(&block) && run.buffer.len() < max_run_bytes)
        {
            run.append(block);
            return Ok(());
        }

        self.flush_run()?;
        self.run = Some(WriteRun::start(block, position));
        Ok(())
    }

    /// Flush the pending run, sync, and close the target when auto-close is set
    pub fn finish(&mut self) -> Result<()> {
        if self.state == WriterState::Opening {
            self.open()?;
        }

        match self.state {
            WriterState::Ready => {}
            WriterState::Flushing | WriterState::Closing | WriterState::Closed => return Ok(()),
            state => return Err(Error::WriterClosed(state)),
        }

        self.state = WriterState::Flushing;
        self.flush_run()?;

        if let Some(target) = self.target.as_mut() {
            if let Err(source) = target.sync() {
                let offset = self.cursor;
                return Err(self.fail(Error::Write { offset, source }));
            }
        }

        tracing::debug!(
            "Writer finished: {} bytes in {} calls",
            self.stats.bytes_written,
            self.stats.write_calls
        );

        if self.auto_close {
            self.close()?;
        }
        Ok(())
    }

    /// Release the target; an unflushed run is dropped
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::Opening => {
                self.pending.push_back(PendingOp::Close);
                return Ok(());
            }
            WriterState::Closing | WriterState::Closed | WriterState::Destroyed => return Ok(()),
            WriterState::Ready | WriterState::Flushing => {}
        }

        if let Some(run) = self.run.take() {
            tracing::warn!(
                "Closing writer with {} unflushed bytes at offset {}",
                run.buffer.len(),
                run.start_position
            );
        }

        self.state = WriterState::Closing;
        let result = match (self.auto_close, self.target.as_mut()) {
            (true, Some(target)) => target.close(),
            _ => Ok(()),
        };
        if self.auto_close {
            self.target = None;
        }

        self.state = WriterState::Closed;
        self.notify_closed();
        result.map_err(Error::Io)
    }

    /// Tear the writer down; later writes fail with [`Error::WriterClosed`]
    pub fn destroy(&mut self) {
        match self.state {
            WriterState::Opening => self.pending.push_back(PendingOp::Destroy),
            WriterState::Closed | WriterState::Destroyed => {}
            _ => self.teardown(WriterState::Destroyed),
        }
    }

    fn flush_run(&mut self) -> Result<()> {
        let Some(run) = self.run.take() else {
            return Ok(());
        };

        tracing::trace!(
            "Flushing run: {} blocks, {} bytes at {}",
            run.block_count,
            run.buffer.len(),
            run.start_position
        );

        self.write_target(run.start_position, &run.buffer, run.block_count)?;
        self.cursor = run.end_position();
        Ok(())
    }

    fn write_target(&mut self, offset: u64, data: &[u8], blocks: u64) -> Result<()> {
        let Some(target) = self.target.as_mut() else {
            return Err(Error::WriterClosed(self.state));
        };

        self.stats.write_calls += 1;
        match target.write_at(offset, data) {
            Ok(n) if n == data.len() => {
                self.stats.bytes_written += n as u64;
                self.stats.blocks_written += blocks;
                Ok(())
            }
            Ok(actual) => Err(self.fail(Error::PartialWrite {
                offset,
                expected: data.len(),
                actual,
            })),
            Err(source) => Err(self.fail(Error::Write { offset, source })),
        }
    }

    fn fail(&mut self, error: Error) -> Error {
        tracing::error!("Writer failed: {}", error);
        self.teardown(WriterState::Destroyed);
        error
    }

    fn teardown(&mut self, state: WriterState) {
        self.run = None;
        if self.auto_close {
            if let Some(mut target) = self.target.take() {
                if let Err(e) = target.close() {
                    tracing::warn!("Failed to close target during teardown: {}", e);
                }
            }
        }
        self.state = state;
        self.notify_closed();
    }

    fn notify_closed(&mut self) {
        if let Some(callback) = self.on_close.take() {
            callback(self.state);
        }
    }
}

impl Drop for CoalescingWriter {
    fn drop(&mut self) {
        if self.run.is_some() {
            tracing::warn!("Writer dropped with an unflushed run");
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
