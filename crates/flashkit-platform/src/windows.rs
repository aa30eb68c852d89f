//! Windows platform implementation
//!
//! Opens `\\.\PhysicalDriveN` paths with unbuffered, write-through I/O and
//! resets partition tables with `diskpart` before writing.

use crate::{
    align_up, diskpart_clean_script, is_aligned, physical_drive_number, AlignedBuffer, DeviceInfo,
    OpenOptions, PlatformError, PlatformOps, RawDevice, Result,
};
use std::fs::{File, OpenOptions as StdOpenOptions};
use std::os::windows::fs::{FileExt, OpenOptionsExt};
use std::os::windows::io::AsRawHandle;
use std::process::Command;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::Storage::FileSystem::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH};

/// Windows platform implementation
pub struct WindowsPlatform;

impl PlatformOps for WindowsPlatform {
    fn open_device(path: &str, options: OpenOptions) -> Result<Box<dyn RawDevice>> {
        WindowsDevice::open(path, options).map(|d| Box::new(d) as Box<dyn RawDevice>)
    }

    fn clean_device(path: &str) -> Result<()> {
        let Some(disk) = physical_drive_number(path) else {
            tracing::debug!("{} is not a physical drive, skipping diskpart", path);
            return Ok(());
        };

        let script = diskpart_clean_script(disk);
        let script_path =
            std::env::temp_dir().join(format!("flashkit-diskpart-{}.txt", std::process::id()));
        std::fs::write(&script_path, &script)?;

        tracing::debug!("diskpart {}", script.replace("\r\n", ";"));
        let output = Command::new("diskpart")
            .arg("/s")
            .arg(&script_path)
            .output();
        let _ = std::fs::remove_file(&script_path);

        match output {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => Err(PlatformError::CommandFailed(format!(
                "diskpart exited with code {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stdout).trim()
            ))),
            Err(e) => Err(PlatformError::CommandFailed(format!(
                "Failed to run diskpart: {}",
                e
            ))),
        }
    }

    fn has_elevated_privileges() -> bool {
        is_elevated()
    }
}

/// Windows device or image file opened for positional I/O
pub struct WindowsDevice {
    file: File,
    info: DeviceInfo,
    aligned_buffer: Option<AlignedBuffer>,
}

impl WindowsDevice {
    /// Open a physical drive or regular file
    pub fn open(path: &str, options: OpenOptions) -> Result<Self> {
        let device_path = normalize_windows_path(path);
        let is_block_device = physical_drive_number(&device_path).is_some();
        let direct_io = options.direct_io && is_block_device;

        if !is_block_device && !options.create && !std::path::Path::new(path).exists() {
            return Err(PlatformError::DeviceNotFound(path.to_string()));
        }

        let mut std_options = StdOpenOptions::new();
        std_options
            .read(options.read)
            .write(options.write)
            .create(options.create && options.write && !is_block_device);
        if direct_io {
            std_options.custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH);
        }

        let file = std_options.open(&device_path).map_err(|e| match e.raw_os_error() {
            Some(5) => PlatformError::PermissionDenied(format!(
                "Cannot open {}. Run as Administrator.",
                device_path
            )),
            Some(2) | Some(3) => PlatformError::DeviceNotFound(device_path.clone()),
            Some(32) => PlatformError::DeviceBusy(format!("{} is in use", device_path)),
            _ => PlatformError::Io(e),
        })?;

        let size = if is_block_device {
            disk_length(&file)?
        } else {
            file.metadata()?.len()
        };

        Ok(Self {
            file,
            info: DeviceInfo {
                path: device_path,
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

impl RawDevice for WindowsDevice {
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

        let payload: &[u8] = match self.aligned_buffer {
            Some(ref mut buffer) if !is_aligned(data.as_ptr() as usize, block_size) => {
                let aligned = buffer.slice_mut(data.len());
                aligned.copy_from_slice(data);
                aligned
            }
            _ => data,
        };

        let mut written = 0;
        while written < payload.len() {
            match self
                .file
                .seek_write(&payload[written..], offset + written as u64)
            {
                Ok(0) => {
                    return Err(PlatformError::Io(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    )))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PlatformError::Io(e)),
            }
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

fn read_full_at(file: &File, buffer: &mut [u8], offset: u64) -> Result<usize> {
    let mut total = 0;
    while total < buffer.len() {
        match file.seek_read(&mut buffer[total..], offset + total as u64) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PlatformError::Io(e)),
        }
    }
    Ok(total)
}

/// Normalize a Windows device path
fn normalize_windows_path(path: &str) -> String {
    if path.starts_with("\\\\.\\") {
        path.to_string()
    } else if path.to_ascii_lowercase().starts_with("physicaldrive") {
        format!("\\\\.\\{}", path)
    } else if let Ok(n) = path.parse::<u32>() {
        format!("\\\\.\\PhysicalDrive{}", n)
    } else {
        path.to_string()
    }
}

/// Get the length of a physical disk
fn disk_length(file: &File) -> Result<u64> {
    use windows_sys::Win32::System::Ioctl::{GET_LENGTH_INFORMATION, IOCTL_DISK_GET_LENGTH_INFO};
    use windows_sys::Win32::System::IO::DeviceIoControl;

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: GET_LENGTH_INFORMATION is plain old data; all-zero is valid.
    #[allow(unsafe_code)]
    let mut length_info: GET_LENGTH_INFORMATION = unsafe { std::mem::zeroed() };
    let mut bytes_returned: u32 = 0;

    // SAFETY: the handle is owned by `file` and valid for the call; the output
    // pointer and size describe `length_info`.
    #[allow(unsafe_code)]
    let result = unsafe {
        DeviceIoControl(
            handle,
            IOCTL_DISK_GET_LENGTH_INFO,
            std::ptr::null(),
            0,
            &mut length_info as *mut _ as *mut _,
            std::mem::size_of::<GET_LENGTH_INFORMATION>() as u32,
            &mut bytes_returned,
            std::ptr::null_mut(),
        )
    };

    if result == 0 {
        return Err(PlatformError::Io(std::io::Error::last_os_error()));
    }

    Ok(length_info.Length as u64)
}

/// Check whether the process token is elevated
#[allow(unsafe_code)]
fn is_elevated() -> bool {
    use windows_sys::Win32::Security::{
        GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    // SAFETY: the token handle is checked before use and closed afterwards;
    // TOKEN_ELEVATION is plain old data sized for GetTokenInformation.
    unsafe {
        let mut token: HANDLE = 0;
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
            return false;
        }

        let mut elevation: TOKEN_ELEVATION = std::mem::zeroed();
        let mut size: u32 = 0;
        let result = GetTokenInformation(
            token,
            TokenElevation,
            &mut elevation as *mut _ as *mut _,
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );

        CloseHandle(token);

        result != 0 && elevation.TokenIsElevated != 0
    }
}
