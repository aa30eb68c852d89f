//! Destinations a flash run writes to and reads back from

use crate::error::{Error, Result};
use flashkit_platform::{OpenOptions, PlatformError, RawDevice};
use std::io;

/// Positional byte sink/source backing a flash run
pub trait Target: Send {
    /// Write all of `data` at `offset`, returning the byte count accepted
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Read into `buffer` from `offset`; a short count means end of target
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Flush everything written so far to stable storage
    fn sync(&mut self) -> io::Result<()>;

    /// Release the target; nothing is written afterwards
    fn close(&mut self) -> io::Result<()> {
        self.sync()
    }
}

/// Something that can open a [`Target`] for writing and again for reading
pub trait TargetOpener: Send + Sync {
    /// Path or name shown in logs and passed to the clean step
    fn path(&self) -> &str;

    /// Open for writing
    fn open_write(&self) -> Result<Box<dyn Target>>;

    /// Open for read-back
    fn open_read(&self) -> Result<Box<dyn Target>>;
}

// ============================================================================
// Platform devices
// ============================================================================

/// A device or image file opened through `flashkit-platform`
pub struct DeviceTarget(Box<dyn RawDevice>);

impl DeviceTarget {
    /// Wrap an already-open device
    pub fn new(device: Box<dyn RawDevice>) -> Self {
        Self(device)
    }

    /// Size reported by the platform
    pub fn size(&self) -> u64 {
        self.0.size()
    }
}

impl Target for DeviceTarget {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.0.write_at(offset, data).map_err(platform_io)
    }

    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        self.0.read_at(offset, buffer).map_err(platform_io)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.0.sync().map_err(platform_io)
    }
}

fn platform_io(e: PlatformError) -> io::Error {
    match e {
        PlatformError::Io(e) => e,
        other => io::Error::other(other.to_string()),
    }
}

/// Opens a device path or image file
#[derive(Debug, Clone)]
pub struct DeviceOpener {
    path: String,
    options: OpenOptions,
}

impl DeviceOpener {
    /// Open `path` with default options (direct I/O on block devices)
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            options: OpenOptions::new(),
        }
    }

    /// Replace the open options used for writing
    pub fn options(mut self, options: OpenOptions) -> Self {
        self.options = options;
        self
    }

    /// Create a missing image file instead of failing
    pub fn create(mut self, create: bool) -> Self {
        self.options = self.options.create(create);
        self
    }

    /// Options used for writing
    pub fn open_options(&self) -> &OpenOptions {
        &self.options
    }

    fn open(&self, options: OpenOptions) -> Result<Box<dyn Target>> {
        tracing::debug!("Opening {} ({:?})", self.path, options);
        flashkit_platform::open_device(&self.path, options)
            .map(|device| Box::new(DeviceTarget::new(device)) as Box<dyn Target>)
            .map_err(|e| Error::Open {
                path: self.path.clone(),
                message: e.to_string(),
            })
    }
}

impl TargetOpener for DeviceOpener {
    fn path(&self) -> &str {
        &self.path
    }

    fn open_write(&self) -> Result<Box<dyn Target>> {
        self.open(self.options.clone())
    }

    fn open_read(&self) -> Result<Box<dyn Target>> {
        self.open(
            self.options
                .clone()
                .read(true)
                .write(false)
                .create(false),
        )
    }
}
