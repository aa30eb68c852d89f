//! # Flashkit Core
//!
//! Core library for writing disk images to block devices and image files.
//!
//! ## Modules
//!
//! - `blocker`: Rechunks a byte stream into fixed-size, zero-padded blocks
//! - `meter`: Pass-through throughput and ETA sampling
//! - `writer`: Coalescing block writer with a pending-operation queue
//! - `flash`: Clean, flash and verify orchestration
//! - `source`: Image sources and decompression
//! - `checksum`: Streaming digests
//! - `sparse`: Block maps for sparse writes
//! - `target`: Destinations and how they are opened
//! - `clean`: Pre-write partition metadata reset
//! - `config`: Runtime configuration
//! - `settings`: Persistent user settings from configuration file
//! - `error`: Error types and result aliases
//!
//! ## Example
//!
//! ```no_run
//! use flashkit_core::{DeviceOpener, FlashConfig, FlashSource, Flasher};
//! use std::sync::Arc;
//!
//! let source = FlashSource::open("image.img")?;
//! let target = Arc::new(DeviceOpener::new("/dev/sdb"));
//!
//! let mut flasher = Flasher::with_config(FlashConfig::new().block_size(4096).verify(true));
//! let outcome = flasher.run(source, target)?;
//! println!("Wrote {} bytes", outcome.writer.bytes_written);
//! # Ok::<(), flashkit_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod blocker;
pub mod checksum;
pub mod clean;
pub mod config;
pub mod error;
pub mod flash;
pub mod meter;
pub mod settings;
pub mod source;
pub mod sparse;
pub mod stage;
pub mod target;
pub mod writer;

pub use block::Block;
pub use blocker::Blocker;
pub use checksum::{
    digest_reader, Checksum, ChecksumAlgorithm, ChecksumStage, DigestSlot, Hasher, StreamDigest,
};
pub use clean::{Cleaner, NoopCleaner, PlatformCleaner};
pub use config::{
    parse_size, FlashConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_RUN_BYTES, MAX_BLOCK_SIZE,
    MIN_BLOCK_SIZE,
};
pub use error::{Error, Result};
pub use flash::{FlashEvent, FlashOutcome, FlashState, Flasher};
pub use meter::{
    format_duration, format_speed, ProgressCallback, ProgressKind, ProgressSample, RateMeter,
    SpeedWindow, ETA_UNBOUNDED,
};
pub use settings::{BehaviorSettings, FlashSettings, Settings, SettingsError};
#[cfg(feature = "compression")]
pub use source::{Decompress, MAX_DECODED_BLOCK};
pub use source::{Compression, FlashSource, SourceSize};
pub use sparse::{BlockMap, SparseFilter};
pub use stage::{Pipeline, Stage};
pub use target::{DeviceOpener, DeviceTarget, Target, TargetOpener};
pub use writer::{CoalescingWriter, Destination, WriterState, WriterStats};
