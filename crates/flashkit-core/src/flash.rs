//! Flash orchestration
//!
//! A [`Flasher`] drives one run through `Clean -> Flash -> Verify -> Done`,
//! dropping to `Failed` from any active state. During `Flash` a reader
//! thread feeds source chunks over a bounded channel into a linear pipeline
//! that ends in a [`CoalescingWriter`].
//!
//! ## Example
//!
//! ```no_run
//! use flashkit_core::{DeviceOpener, FlashConfig, FlashEvent, FlashSource, Flasher};
//! use std::sync::Arc;
//!
//! let source = FlashSource::open("image.img.gz")?;
//! let target = Arc::new(DeviceOpener::new("/dev/sdb"));
//!
//! let mut flasher = Flasher::with_config(FlashConfig::new().verify(true)).on_event(|event| {
//!     if let FlashEvent::Progress(sample) = event {
//!         println!("{:.1}% - {}", sample.percentage, sample.speed_display());
//!     }
//! });
//!
//! let outcome = flasher.run(source, target)?;
//! println!("Wrote {} bytes in {:?}", outcome.writer.bytes_written, outcome.elapsed);
//! # Ok::<(), flashkit_core::Error>(())
//! ```

use crate::block::Block;
use crate::blocker::Blocker;
use crate::checksum::{Checksum, ChecksumAlgorithm, ChecksumStage, Hasher};
use crate::clean::{Cleaner, PlatformCleaner};
use crate::config::FlashConfig;
use crate::error::{Error, Result};
use crate::meter::{ProgressCallback, ProgressKind, ProgressSample, RateMeter};
use crate::source::FlashSource;
use crate::sparse::BlockMap;
use crate::stage::Pipeline;
use crate::target::{Target, TargetOpener};
use crate::writer::{CoalescingWriter, Destination, WriterStats};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// ============================================================================
// States and events
// ============================================================================

/// Stage of a flash run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Resetting the target's partition metadata
    Clean,
    /// Writing the source
    Flash,
    /// Reading back and comparing digests
    Verify,
    /// Finished successfully
    Done,
    /// Aborted
    Failed,
}

impl std::fmt::Display for FlashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlashState::Clean => "clean",
            FlashState::Flash => "flash",
            FlashState::Verify => "verify",
            FlashState::Done => "done",
            FlashState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Notifications delivered to the [`Flasher::on_event`] callback
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// The run moved to a new state
    StageEntered(FlashState),
    /// Periodic throughput sample from the write or verify pass
    Progress(ProgressSample),
    /// Digest of the source, captured during `Flash`
    Checksum(Checksum),
    /// The run finished
    Completed {
        /// Source digest, when verification was requested
        source_checksum: Option<Checksum>,
    },
    /// The run aborted
    Failed(String),
}

type EventCallback = Arc<dyn Fn(&FlashEvent) + Send + Sync>;

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct FlashOutcome {
    /// Digest of the source, when verification was requested
    pub source_checksum: Option<Checksum>,
    /// Whether the target was read back and matched
    pub verified: bool,
    /// Number of source bytes covered by the digest
    pub bytes_hashed: u64,
    /// Writer counters
    pub writer: WriterStats,
    /// Pipeline stage names, in order, ending with the writer
    pub stages: Vec<&'static str>,
    /// Wall time of the whole run
    pub elapsed: Duration,
}

/// Per-run bookkeeping
struct RunContext {
    target: String,
    block_size: usize,
    verify: bool,
    algorithm: ChecksumAlgorithm,
    source_checksum: Option<Checksum>,
    bytes_hashed: u64,
    block_map: Option<Arc<BlockMap>>,
    stages: Vec<&'static str>,
    state: FlashState,
}

// ============================================================================
// Flasher
// ============================================================================

/// Runs clean, flash and verify against one target
pub struct Flasher {
    config: FlashConfig,
    cleaner: Box<dyn Cleaner>,
    on_event: Option<EventCallback>,
    cancel_flag: Arc<AtomicBool>,
}

impl Flasher {
    /// Create a flasher with default configuration
    pub fn new() -> Self {
        Self::with_config(FlashConfig::default())
    }

    /// Create a flasher with custom configuration
    pub fn with_config(config: FlashConfig) -> Self {
        Self {
            config,
            cleaner: Box::new(PlatformCleaner),
            on_event: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the pre-write clean step
    pub fn cleaner<C: Cleaner + 'static>(mut self, cleaner: C) -> Self {
        self.cleaner = Box::new(cleaner);
        self
    }

    /// Set the event callback
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(&FlashEvent) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// Get a handle to cancel the run
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Current configuration
    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    /// Flash `source` onto the target opened by `opener`
    pub fn run(
        &mut self,
        source: FlashSource,
        opener: Arc<dyn TargetOpener>,
    ) -> Result<FlashOutcome> {
        let start = Instant::now();
        self.cancel_flag.store(false, Ordering::SeqCst);

        let mut ctx = RunContext {
            target: opener.path().to_string(),
            block_size: self.config.block_size,
            verify: self.config.verify,
            algorithm: self.config.checksum_algorithm,
            source_checksum: None,
            bytes_hashed: 0,
            block_map: None,
            stages: Vec::new(),
            state: FlashState::Clean,
        };

        match self.run_stages(&mut ctx, source, opener) {
            Ok(writer) => {
                self.enter(&mut ctx, FlashState::Done);
                tracing::info!(
                    "Flashed {} bytes to {} in {:?}",
                    writer.bytes_written,
                    ctx.target,
                    start.elapsed()
                );
                self.emit(FlashEvent::Completed {
                    source_checksum: ctx.source_checksum.clone(),
                });

                Ok(FlashOutcome {
                    source_checksum: ctx.source_checksum,
                    verified: ctx.verify,
                    bytes_hashed: ctx.bytes_hashed,
                    writer,
                    stages: ctx.stages,
                    elapsed: start.elapsed(),
                })
            }
            Err(e) => {
                tracing::error!("Flash of {} failed during {}: {}", ctx.target, ctx.state, e);
                self.enter(&mut ctx, FlashState::Failed);
                self.emit(FlashEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn run_stages(
        &self,
        ctx: &mut RunContext,
        source: FlashSource,
        opener: Arc<dyn TargetOpener>,
    ) -> Result<WriterStats> {
        self.config.validate()?;

        self.enter(ctx, FlashState::Clean);
        self.cleaner.clean_target(&ctx.target)?;
        self.check_cancelled()?;

        self.enter(ctx, FlashState::Flash);
        let stats = self.flash(ctx, source, Arc::clone(&opener))?;

        if ctx.verify {
            self.enter(ctx, FlashState::Verify);
            self.verify(ctx, opener.as_ref())?;
        }

        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // Flash
    // ------------------------------------------------------------------------

    fn flash(
        &self,
        ctx: &mut RunContext,
        source: FlashSource,
        opener: Arc<dyn TargetOpener>,
    ) -> Result<WriterStats> {
        let FlashSource {
            reader,
            size,
            transform,
            block_map,
            ..
        } = source;
        ctx.block_map = block_map.clone();

        let mut writer = CoalescingWriter::new(Destination::Opener(opener))
            .max_run_bytes(self.config.max_run_bytes)
            .auto_close(self.config.auto_close);
        writer.open()?;

        let mut pipeline = Pipeline::new();
        if let Some(transform) = transform {
            pipeline.append(transform);
        }

        let digest = ctx.verify.then(|| {
            let (stage, slot) = ChecksumStage::new(ctx.algorithm);
            pipeline.append(Box::new(stage));
            slot
        });

        let meter_length = if size.estimated {
            size.original
        } else {
            size.final_size
        };
        let mut meter =
            RateMeter::new(ProgressKind::Write, meter_length, self.config.progress_interval);
        if let Some(callback) = self.progress_callback() {
            meter = meter.on_sample(callback);
        }
        if size.estimated {
            pipeline.prepend(Box::new(meter));
        } else {
            pipeline.append(Box::new(meter));
        }

        pipeline.append(Box::new(Blocker::new(ctx.block_size)?));
        if let Some(map) = &block_map {
            pipeline.append(Box::new(map.filter_stage(ctx.block_size)));
        }

        ctx.stages = pipeline.names();
        ctx.stages.push("writer");
        tracing::debug!("Flash pipeline: {}", ctx.stages.join(" -> "));

        let (tx, rx) = mpsc::sync_channel(self.config.channel_depth);
        let reader = spawn_reader(reader, self.config.read_chunk_size, tx);

        let result = self.pump(&rx, &mut pipeline, &mut writer);

        drop(rx);
        if reader.join().is_err() {
            tracing::warn!("Source reader thread panicked");
        }

        if let Err(e) = result {
            writer.destroy();
            return Err(e);
        }

        if let Some(digest) = digest.and_then(|slot| slot.take()) {
            self.emit(FlashEvent::Checksum(digest.checksum.clone()));
            ctx.source_checksum = Some(digest.checksum);
            ctx.bytes_hashed = digest.length;
        }

        tracing::info!(
            "Flash stage complete: {} bytes in {} write calls",
            writer.stats().bytes_written,
            writer.stats().write_calls
        );
        Ok(writer.stats())
    }

    fn pump(
        &self,
        rx: &Receiver<io::Result<Vec<u8>>>,
        pipeline: &mut Pipeline,
        writer: &mut CoalescingWriter,
    ) -> Result<()> {
        let mut sink = |block: Block| writer.write(block);

        for chunk in rx {
            self.check_cancelled()?;
            let data = chunk.map_err(|e| Error::upstream("source", e))?;
            pipeline.push(Block::raw(data), &mut sink)?;
        }

        self.check_cancelled()?;
        pipeline.finish(&mut sink)?;
        writer.finish()
    }

    // ------------------------------------------------------------------------
    // Verify
    // ------------------------------------------------------------------------

    fn verify(&self, ctx: &RunContext, opener: &dyn TargetOpener) -> Result<()> {
        let expected = ctx
            .source_checksum
            .clone()
            .ok_or_else(|| Error::upstream("checksum", "No source checksum was captured"))?;
        let total = ctx.bytes_hashed;
        let block_size = ctx.block_size;

        let mut target = opener.open_read()?;
        let mut hasher = Hasher::new(ctx.algorithm);
        let mut meter =
            RateMeter::new(ProgressKind::Verify, total, self.config.progress_interval);
        if let Some(callback) = self.progress_callback() {
            meter = meter.on_sample(callback);
        }

        let mut buffer = vec![0u8; block_size];
        let zeros = vec![0u8; block_size];
        let mut offset = 0u64;

        while offset < total {
            self.check_cancelled()?;

            let len = (total - offset).min(block_size as u64) as usize;
            let mapped = ctx
                .block_map
                .as_ref()
                .is_none_or(|map| map.is_mapped(offset, offset + len as u64));

            if mapped {
                let n = read_full_at(target.as_mut(), offset, &mut buffer[..len])?;
                if n < len {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("Target ended at {} of {} bytes", offset + n as u64, total),
                    )));
                }
                hasher.update(&buffer[..len]);
            } else {
                hasher.update(&zeros[..len]);
            }

            meter.observe(len as u64);
            offset += len as u64;
        }
        meter.finish();

        let actual = hasher.finalize();
        if actual != expected {
            return Err(Error::ChecksumMismatch {
                algorithm: ctx.algorithm.name().to_string(),
                expected: expected.to_hex(),
                actual: actual.to_hex(),
            });
        }

        tracing::info!("Verified {} bytes ({} {})", total, ctx.algorithm, actual);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn enter(&self, ctx: &mut RunContext, state: FlashState) {
        tracing::debug!("{} -> {}", ctx.state, state);
        ctx.state = state;
        self.emit(FlashEvent::StageEntered(state));
    }

    fn emit(&self, event: FlashEvent) {
        if let Some(ref callback) = self.on_event {
            callback(&event);
        }
    }

    fn progress_callback(&self) -> Option<ProgressCallback> {
        let events = self.on_event.clone()?;
        Some(Arc::new(move |sample: &ProgressSample| {
            events(&FlashEvent::Progress(sample.clone()))
        }))
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel_flag.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl Default for Flasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Read source chunks on a separate thread until EOF, error, or the
/// receiving side hangs up
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    chunk_size: usize,
    tx: SyncSender<io::Result<Vec<u8>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        let mut buffer = vec![0u8; chunk_size];
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                buffer.truncate(n);
                if tx.send(Ok(buffer)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    })
}

fn read_full_at(target: &mut dyn Target, offset: u64, buffer: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        match target.read_at(offset + total as u64, &mut buffer[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(total)
}

// ============================================================================
// Unit Tests
// ============================================================================
