//! Runtime configuration for flash operations

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use std::time::Duration;

/// Default block size (4 KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Minimum block size (one 512-byte sector)
pub const MIN_BLOCK_SIZE: usize = 512;

/// Maximum block size (64 MB)
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Byte count at which a coalesced write run is flushed (128 KB)
pub const DEFAULT_MAX_RUN_BYTES: usize = 128 * 1024;

/// Size of each read from the source (64 KB)
pub const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

/// Number of source chunks allowed in flight between reader and pipeline
pub const DEFAULT_CHANNEL_DEPTH: usize = 4;

/// Interval between progress samples
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a flash run
#[derive(Debug, Clone)]
pub struct FlashConfig {
    /// Size of the blocks written to the target
    pub block_size: usize,

    /// Whether to read back and verify after writing
    pub verify: bool,

    /// Algorithm used for the source digest and the read-back digest
    pub checksum_algorithm: ChecksumAlgorithm,

    /// Cap on bytes buffered in one coalesced write
    pub max_run_bytes: usize,

    /// Size of each read from the source
    pub read_chunk_size: usize,

    /// Bounded channel capacity between the source reader and the pipeline
    pub channel_depth: usize,

    /// Interval between progress samples
    pub progress_interval: Duration,

    /// Close the target when the writer finishes or fails
    pub auto_close: bool,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: false,
            checksum_algorithm: ChecksumAlgorithm::default(),
            max_run_bytes: DEFAULT_MAX_RUN_BYTES,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            channel_depth: DEFAULT_CHANNEL_DEPTH,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            auto_close: true,
        }
    }
}

impl FlashConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set block size (clamped to valid range)
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        self
    }

    /// Set verify mode
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Set checksum algorithm
    pub fn checksum_algorithm(mut self, algorithm: ChecksumAlgorithm) -> Self {
        self.checksum_algorithm = algorithm;
        self
    }

    /// Set the coalesced run cap
    pub fn max_run_bytes(mut self, bytes: usize) -> Self {
        self.max_run_bytes = bytes.max(1);
        self
    }

    /// Set the source read size
    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Set the reader/pipeline channel capacity
    pub fn channel_depth(mut self, depth: usize) -> Self {
        self.channel_depth = depth.max(1);
        self
    }

    /// Set the progress sampling interval
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Set auto-close
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// Check invariants the builder cannot enforce on its own
    pub fn validate(&self) -> Result<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(Error::InvalidConfig(format!(
                "Block size {} outside {}..={}",
                self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }
        if self.block_size % MIN_BLOCK_SIZE != 0 {
            return Err(Error::InvalidConfig(format!(
                "Block size {} is not a multiple of {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if self.progress_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "Progress interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a human size string such as `4096`, `4K`, `1M` or `2G`
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();
    let s = s.strip_suffix('B').unwrap_or(&s);

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("Invalid size: {}", s)))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidConfig(format!("Size too large: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = FlashConfig::default();
        assert_eq!(config.block_size, DEFAULT_BLOCK_SIZE);
        assert!(!config.verify);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Crc32);
        assert_eq!(config.max_run_bytes, 128 * 1024);
        assert_eq!(config.progress_interval, Duration::from_millis(500));
        assert!(config.auto_close);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = FlashConfig::new()
            .block_size(1024 * 1024)
            .verify(true)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .max_run_bytes(64 * 1024)
            .channel_depth(8)
            .auto_close(false);

        assert_eq!(config.block_size, 1024 * 1024);
        assert!(config.verify);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Sha256);
        assert_eq!(config.max_run_bytes, 64 * 1024);
        assert_eq!(config.channel_depth, 8);
        assert!(!config.auto_close);
    }

    #[test]
    fn test_config_block_size_clamping() {
        assert_eq!(FlashConfig::new().block_size(100).block_size, MIN_BLOCK_SIZE);
        assert_eq!(
            FlashConfig::new().block_size(1024 * 1024 * 1024).block_size,
            MAX_BLOCK_SIZE
        );
    }

    #[test]
    fn test_config_zero_values_are_raised() {
        let config = FlashConfig::new()
            .read_chunk_size(0)
            .channel_depth(0)
            .max_run_bytes(0);
        assert_eq!(config.read_chunk_size, 1);
        assert_eq!(config.channel_depth, 1);
        assert_eq!(config.max_run_bytes, 1);
    }

    #[test]
    fn test_validate_rejects_unaligned_block_size() {
        let config = FlashConfig {
            block_size: 1000,
            ..FlashConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = FlashConfig::new().progress_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("128KB").unwrap(), 128 * 1024);
        assert_eq!(parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_size(" 2G ").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("4X").is_err());
        assert!(parse_size("-1K").is_err());
    }
}
