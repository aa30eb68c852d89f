//! Pre-write clean step

use crate::error::{Error, Result};

/// Prepares a target before any bytes are written
pub trait Cleaner: Send + Sync {
    /// Clear stale partition metadata on `path`
    fn clean_target(&self, path: &str) -> Result<()>;
}

/// Uses the platform's partition-table reset (diskpart on Windows)
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformCleaner;

impl Cleaner for PlatformCleaner {
    fn clean_target(&self, path: &str) -> Result<()> {
        flashkit_platform::clean_device(path).map_err(|e| Error::Clean(e.to_string()))
    }
}

/// Does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCleaner;

impl Cleaner for NoopCleaner {
    fn clean_target(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}
