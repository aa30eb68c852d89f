//! Error types for the Flashkit core library

use crate::writer::WriterState;
use thiserror::Error;

/// Main error type for Flashkit operations
#[derive(Error, Debug)]
pub enum Error {
    /// Destination could not be opened
    #[error("Failed to open {path}: {message}")]
    Open {
        /// Destination path
        path: String,
        /// Reason reported by the platform layer
        message: String,
    },

    /// A write to the destination failed
    #[error("Write failed at offset {offset}: {source}")]
    Write {
        /// Byte offset of the failed write
        offset: u64,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The destination accepted fewer bytes than requested
    #[error("Partial write at offset {offset}: expected {expected} bytes, wrote {actual} bytes")]
    PartialWrite {
        /// Byte offset of the write
        offset: u64,
        /// Bytes requested
        expected: usize,
        /// Bytes actually written
        actual: usize,
    },

    /// Platform pre-write clean step failed
    #[error("Failed to clean target: {0}")]
    Clean(String),

    /// Verification digest disagrees with the source digest
    #[error("Checksum mismatch ({algorithm}): expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Algorithm name
        algorithm: String,
        /// Digest captured while flashing
        expected: String,
        /// Digest read back from the target
        actual: String,
    },

    /// The source stream or a pipeline stage failed
    #[error("Stage '{stage}' failed: {message}")]
    Upstream {
        /// Name of the failing stage
        stage: &'static str,
        /// Failure description
        message: String,
    },

    /// Write attempted on a writer that is closed or destroyed
    #[error("Writer is {0}; no further writes accepted")]
    WriterClosed(WriterState),

    /// IO error outside the write path
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Shorthand for an upstream failure in the named stage
    pub fn upstream(stage: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Upstream {
            stage,
            message: message.to_string(),
        }
    }
}

/// Result type alias using the Flashkit error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Open {
            path: "/dev/sdz".to_string(),
            message: "Device not found".to_string(),
        };
        assert!(err.to_string().contains("/dev/sdz"));

        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "Operation cancelled");

        let err = Error::PartialWrite {
            offset: 8192,
            expected: 4096,
            actual: 2048,
        };
        let msg = err.to_string();
        assert!(msg.contains("8192"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_checksum_mismatch_error() {
        let err = Error::ChecksumMismatch {
            algorithm: "CRC32".to_string(),
            expected: "deadbeef".to_string(),
            actual: "00000000".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("CRC32"));
        assert!(msg.contains("deadbeef"));
        assert!(msg.contains("00000000"));
    }

    #[test]
    fn test_upstream_helper() {
        let err = Error::upstream("decompress", "corrupt deflate stream");
        assert_eq!(
            err.to_string(),
            "Stage 'decompress' failed: corrupt deflate stream"
        );
    }

    #[test]
    fn test_writer_closed_error() {
        let err = Error::WriterClosed(WriterState::Destroyed);
        assert!(err.to_string().contains("destroyed"));
    }
}
