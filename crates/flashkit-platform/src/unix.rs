//! Unix platform implementation (Linux and macOS)
//!
//! Uses `O_DIRECT` on Linux and `F_NOCACHE` on macOS for block devices, and
//! positional `pread`/`pwrite` through `std::os::unix::fs::FileExt`.

use crate::{
    align_up, is_aligned, AlignedBuffer, DeviceInfo, OpenOptions, PlatformError, PlatformOps,
    RawDevice, Result,
};
use std::fs::{File, OpenOptions as StdOpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::Path;

/// Unix platform implementation
pub struct UnixPlatform;

impl PlatformOps for UnixPlatform {
    fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>> {
        UnixDevice::open(path, options).map(|d| Box::new(d) as Box<dyn RawDevice>)
    }

    fn clean_device(path: &str) -> Result<()> {
        tracing::debug!("No partition table reset needed for {}", path);
        Ok(())
    }

    fn has_elevated_privileges() -> bool {
        // SAFETY: geteuid() has no preconditions and cannot fail.
        #[allow(unsafe_code)]
        unsafe {
            libc::geteuid() == 0
        }
    }
}

/// Unix device or image file opened for positional I/O
pub struct UnixDevice {
    file: File,
    info: DeviceInfo,
    aligned_buffer: Option<AlignedBuffer>,
}

impl UnixDevice {
    /// Open a device or regular file
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let device_path = Path::new(path);

        if !device_path.exists() && !options.create {
            return Err(PlatformError::DeviceNotFound(path.to_string()));
        }

        let is_block_device = std::fs::metadata(device_path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        let direct_io = options.direct_io && is_block_device;

        let mut std_options = StdOpenOptions::new();
        std_options
            .read(options.read)
            .write(options.write)
            .create(options.create && options.write && !is_block_device);

        #[cfg(target_os = "linux")]
        if direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            std_options.custom_flags(libc::O_DIRECT);
        }

        let file = std_options.open(device_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                PlatformError::PermissionDenied(format!(
                    "Cannot open {}: {}. Try running with sudo.",
                    path, e
                ))
            } else if e.raw_os_error() == Some(libc::EBUSY) {
                PlatformError::DeviceBusy(format!("{} is busy. Try unmounting first.", path))
            } else {
                PlatformError::Io(e)
            }
        })?;

        #[cfg(target_os = "macos")]
        if direct_io {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fcntl is called on a valid, owned descriptor.
            #[allow(unsafe_code)]
            let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if result == -1 {
                tracing::warn!("F_NOCACHE failed for {}, continuing cached", path);
            }
        }

        let size = device_size(&file, is_block_device)?;

        tracing::debug!(
            "Opened {} ({} bytes, block_device={}, direct_io={})",
            path,
            size,
            is_block_device,
            direct_io
        );

        Ok(Self {
            file,
            info: DeviceInfo {
                path: path.to_string(),
                size,
                block_size: options.block_size as u32,
                direct_io,
                is_block_device,
            },
            aligned_buffer: direct_io.then(|| AlignedBuffer::new(options.block_size)),
        })
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        let block_size = self.info.block_size as usize;
        if self.info.direct_io && !is_aligned(offset as usize, block_size) {
            return Err(PlatformError::AlignmentError(format!(
                "Offset {} is not aligned to block size {}",
                offset, block_size
            )));
        }
        Ok(())
    }

    /// Direct writes must cover whole blocks; padding them would clobber
    /// whatever follows on the device
    fn check_length(&self, len: usize) -> Result<()> {
        let block_size = self.info.block_size as usize;
        if self.info.direct_io && !is_aligned(len, block_size) {
            return Err(PlatformError::AlignmentError(format!(
                "Write of {} bytes is not a multiple of block size {}",
                len, block_size
            )));
        }
        Ok(())
    }
}

impl RawDevice for UnixDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(PlatformError::Io)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_offset(offset)?;
        self.check_length(data.len())?;
        let block_size = self.info.block_size as usize;

        match self.aligned_buffer {
            Some(ref mut buffer) if !is_aligned(data.as_ptr() as usize, block_size) => {
                let aligned = buffer.slice_mut(data.len());
                aligned.copy_from_slice(data);
                self.file.write_all_at(aligned, offset)?;
            }
            _ => self.file.write_all_at(data, offset)?,
        }

        Ok(data.len())
    }

    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
        self.check_offset(offset)?;
        let block_size = self.info.block_size as usize;

        match self.aligned_buffer {
            Some(ref mut aligned)
                if !is_aligned(buffer.as_ptr() as usize, block_size)
                    || !is_aligned(buffer.len(), block_size) =>
            {
                let scratch = aligned.slice_mut(align_up(buffer.len(), block_size));
                let n = read_full_at(&self.file, scratch, offset)?.min(buffer.len());
                buffer[..n].copy_from_slice(&scratch[..n]);
                Ok(n)
            }
            _ => read_full_at(&self.file, buffer, offset),
        }
    }
}

/// Read until `buffer` is full or EOF is reached
fn read_full_at(file: &File, buffer: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        match file.read_at(&mut buffer[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PlatformError::Io(e)),
        }
    }
    Ok(total)
}

/// Size of a block device (ioctl on Linux, seek-to-end elsewhere) or regular file
fn device_size(file: &File, is_block_device: bool) -> Result<u64> {
    if !is_block_device {
        return Ok(file.metadata()?.len());
    }

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a u64 through the provided pointer, which
        // points at a live local; the descriptor is valid for the call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if result == 0 && size > 0 {
            return Ok(size);
        }
    }

    let mut handle = file;
    let size = handle.seek(SeekFrom::End(0))?;
    handle.seek(SeekFrom::Start(0))?;
    Ok(size)
}
