//! # Flashkit Platform
//!
//! Platform-specific adapters for raw device I/O and the pre-write clean step.
//!
//! This crate provides positional access to block devices and image files for
//! writing disk images. It hides the platform differences in opening devices
//! with direct I/O, querying their size, and resetting stale partition
//! metadata before a write.
//!
//! ## Safety
//!
//! This crate performs raw device I/O which can destroy data. All operations
//! require explicit device paths.

#![warn(missing_docs)]
#![warn(clippy::all)]

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Device access denied (need elevated privileges)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device is busy or locked
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation not supported on this platform
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// External command execution failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Alignment error for direct I/O
    #[error("Alignment error: {0}")]
    AlignmentError(String),
}

/// Result type for platform operations
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Options for opening a device
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Use direct I/O (bypass page cache). Only honored for block devices.
    pub direct_io: bool,

    /// Open for reading
    pub read: bool,

    /// Open for writing
    pub write: bool,

    /// Create the target if it is missing (regular files only)
    pub create: bool,

    /// Block size for alignment (typically 512 or 4096)
    pub block_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            direct_io: true,
            read: true,
            write: true,
            create: false,
            block_size: 4096,
        }
    }
}

impl OpenOptions {
    /// Create new options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for a read-only handle (used for read-back)
    pub fn read_only() -> Self {
        Self::default().write(false)
    }

    /// Set direct I/O mode
    pub fn direct_io(mut self, direct: bool) -> Self {
        self.direct_io = direct;
        self
    }

    /// Set read access
    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    /// Set write access
    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    /// Set whether a missing regular file is created
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Set block size for alignment
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }
}

/// Information about an open device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Device path
    pub path: String,

    /// Total size in bytes
    pub size: u64,

    /// Block size used for alignment
    pub block_size: u32,

    /// Whether direct I/O is enabled
    pub direct_io: bool,

    /// Whether the path is a block device (as opposed to a regular file)
    pub is_block_device: bool,
}

/// Positional I/O against an open device or image file
pub trait RawDevice: Send {
    /// Get information about the device
    fn info(&self) -> &DeviceInfo;

    /// Get the device size in bytes
    fn size(&self) -> u64 {
        self.info().size
    }

    /// Sync all pending writes to the device
    fn sync(&self) -> Result<()>;

    /// Write all of `data` at a specific offset, returning the bytes written
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Read into `buffer` from a specific offset, stopping early only at EOF
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize>;
}

/// Platform operations interface
pub trait PlatformOps {
    /// Open a device for raw I/O
    fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>>;

    /// Reset stale partition metadata on a device before writing.
    ///
    /// A no-op on platforms that do not need it.
    fn clean_device(path: &str) -> Result<()>;

    /// Check if running with elevated privileges
    fn has_elevated_privileges() -> bool;
}

/// Align a value up to the given alignment
#[inline]
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Align a value down to the given alignment
#[inline]
pub fn align_down(value: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return value;
    }
    value & !(alignment - 1)
}

/// Check if a value is aligned to the given alignment
#[allow(clippy::manual_is_multiple_of)]
#[inline]
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    if alignment == 0 {
        return true;
    }
    value % alignment == 0
}

/// Extract the disk number from a Windows physical drive path
/// (e.g. `\\.\PhysicalDrive3` -> 3). Matching is case-insensitive.
pub fn physical_drive_number(path: &str) -> Option<u32> {
    let lower = path.to_ascii_lowercase();
    let idx = lower.find("physicaldrive")?;
    let digits: String = lower[idx + "physicaldrive".len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Build the `diskpart` script that wipes the partition table of a disk.
///
/// `clean` runs twice; a single pass occasionally leaves the disk busy.
pub fn diskpart_clean_script(disk_number: u32) -> String {
    [
        "rescan".to_string(),
        format!("select disk {}", disk_number),
        "clean".to_string(),
        "clean".to_string(),
        "rescan".to_string(),
    ]
    .join("\r\n")
}

/// Over-allocated buffer handing out slices aligned for direct I/O
pub(crate) struct AlignedBuffer {
    data: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    pub(crate) fn new(alignment: usize) -> Self {
        Self {
            data: Vec::new(),
            alignment: alignment.max(1),
        }
    }

    /// Aligned, zeroed slice of `len` bytes; grows the backing storage if needed
    pub(crate) fn slice_mut(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() < len + self.alignment {
            self.data = vec![0u8; len + self.alignment];
        }
        let offset = self.data.as_ptr().align_offset(self.alignment);
        let slice = &mut self.data[offset..offset + len];
        slice.fill(0);
        slice
    }
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::UnixPlatform as Platform;
    } else if #[cfg(windows)] {
        mod windows;
        pub use windows::WindowsPlatform as Platform;
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(unix, windows))] {
        /// Open a device for raw I/O using platform defaults
        pub fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>> {
            Platform::open_device(path, options)
        }

        /// Reset stale partition metadata before writing (no-op where not needed)
        pub fn clean_device(path: &str) -> Result<()> {
            Platform::clean_device(path)
        }

        /// Check if running with elevated privileges
        pub fn has_elevated_privileges() -> bool {
            Platform::has_elevated_privileges()
        }
    } else {
        /// Open a device (unsupported platform)
        pub fn open_device(_path: &str, _options: OpenOptions) -> Result<Box<dyn RawDevice>> {
            Err(PlatformError::NotSupported("Platform not supported".to_string()))
        }

        /// Clean a device (unsupported platform)
        pub fn clean_device(_path: &str) -> Result<()> {
            Ok(())
        }

        /// Check privileges (unsupported platform)
        pub fn has_elevated_privileges() -> bool {
            false
        }
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -------------------------------------------------------------------------
    // Alignment tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_align_up_basic() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(513, 512), 1024);
        assert_eq!(align_up(100, 0), 100);
    }

    #[test]
    fn test_align_down_basic() {
        assert_eq!(align_down(511, 512), 0);
        assert_eq!(align_down(1023, 512), 512);
        assert_eq!(align_down(8191, 4096), 4096);
        assert_eq!(align_down(100, 0), 100);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(0, 4096));
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(4097, 4096));
        assert!(is_aligned(7, 0));
    }

    #[test]
    fn test_aligned_buffer_grows_and_aligns() {
        let mut buffer = AlignedBuffer::new(4096);

        let slice = buffer.slice_mut(4096);
        assert_eq!(slice.len(), 4096);
        assert!(is_aligned(slice.as_ptr() as usize, 4096));
        slice[0] = 0xFF;

        let slice = buffer.slice_mut(128 * 1024);
        assert_eq!(slice.len(), 128 * 1024);
        assert!(is_aligned(slice.as_ptr() as usize, 4096));
        assert!(slice.iter().all(|&b| b == 0));
    }

    // -------------------------------------------------------------------------
    // Clean helpers
    // -------------------------------------------------------------------------

    #[test]
    fn test_physical_drive_number() {
        assert_eq!(physical_drive_number(r"\\.\PhysicalDrive3"), Some(3));
        assert_eq!(physical_drive_number(r"\\.\PHYSICALDRIVE12"), Some(12));
        assert_eq!(physical_drive_number("physicaldrive0"), Some(0));
        assert_eq!(physical_drive_number("/dev/sdb"), None);
        assert_eq!(physical_drive_number(r"\\.\PhysicalDrive"), None);
    }

    #[test]
    fn test_diskpart_clean_script() {
        let script = diskpart_clean_script(2);
        let lines: Vec<&str> = script.split("\r\n").collect();
        assert_eq!(
            lines,
            vec!["rescan", "select disk 2", "clean", "clean", "rescan"]
        );
    }

    // -------------------------------------------------------------------------
    // OpenOptions tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_open_options_default() {
        let opts = OpenOptions::default();
        assert!(opts.direct_io);
        assert!(opts.read);
        assert!(opts.write);
        assert!(!opts.create);
        assert_eq!(opts.block_size, 4096);
    }

    #[test]
    fn test_open_options_read_only() {
        let opts = OpenOptions::read_only();
        assert!(opts.read);
        assert!(!opts.write);
    }

    #[test]
    fn test_error_display() {
        let err = PlatformError::PermissionDenied("need root".to_string());
        assert!(err.to_string().contains("Permission denied"));

        let err = PlatformError::DeviceNotFound("/dev/sdz".to_string());
        assert!(err.to_string().contains("not found"));
    }
}
