//! Streaming checksums
//!
//! Provides the algorithms used to fingerprint a source while it is flashed
//! and to re-derive the same digest from the target during verification.

use crate::block::Block;
use crate::error::{Error, Result};
use crate::stage::Stage;
use sha2::Digest;
use std::io::Read;
use std::sync::{Arc, Mutex, PoisonError};

// ============================================================================
// Checksum Algorithm
// ============================================================================

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChecksumAlgorithm {
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
    /// MD5
    Md5,
    /// CRC32 (fast, not cryptographic)
    #[default]
    Crc32,
}

impl ChecksumAlgorithm {
    /// Digest length in bytes
    pub fn byte_length(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 32,
            ChecksumAlgorithm::Sha512 => 64,
            ChecksumAlgorithm::Md5 => 16,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }

    /// Digest length in hex characters
    pub fn hex_length(&self) -> usize {
        self.byte_length() * 2
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha256 => "SHA-256",
            ChecksumAlgorithm::Sha512 => "SHA-512",
            ChecksumAlgorithm::Md5 => "MD5",
            ChecksumAlgorithm::Crc32 => "CRC32",
        }
    }

    /// Every supported algorithm
    pub fn all() -> &'static [ChecksumAlgorithm] {
        &[
            ChecksumAlgorithm::Sha256,
            ChecksumAlgorithm::Sha512,
            ChecksumAlgorithm::Md5,
            ChecksumAlgorithm::Crc32,
        ]
    }
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ChecksumAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(ChecksumAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(ChecksumAlgorithm::Sha512),
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "crc32" | "crc-32" => Ok(ChecksumAlgorithm::Crc32),
            other => Err(Error::InvalidConfig(format!(
                "Unknown checksum algorithm: {}",
                other
            ))),
        }
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// A finished digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum {
    /// Algorithm that produced the digest
    pub algorithm: ChecksumAlgorithm,
    /// Raw digest bytes
    pub bytes: Vec<u8>,
}

impl Checksum {
    /// Wrap raw digest bytes
    pub fn new(algorithm: ChecksumAlgorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    /// Parse a hex digest
    pub fn from_hex(algorithm: ChecksumAlgorithm, hex: &str) -> Result<Self> {
        let hex = hex.trim().to_lowercase();
        if hex.len() != algorithm.hex_length() {
            return Err(Error::InvalidConfig(format!(
                "Invalid {} checksum length: expected {}, got {}",
                algorithm.name(),
                algorithm.hex_length(),
                hex.len()
            )));
        }

        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!("Invalid hex character at position {}", i))
                    })
            })
            .collect::<Result<Vec<u8>>>()?;

        Ok(Self { algorithm, bytes })
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Hasher
// ============================================================================

/// Incremental digest over any supported algorithm
#[derive(Clone)]
pub enum Hasher {
    /// SHA-256 state
    Sha256(sha2::Sha256),
    /// SHA-512 state
    Sha512(sha2::Sha512),
    /// MD5 state
    Md5(md5::Md5),
    /// CRC32 state
    Crc32(crc32fast::Hasher),
}

impl Hasher {
    /// Fresh state for `algorithm`
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            ChecksumAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
            ChecksumAlgorithm::Md5 => Hasher::Md5(md5::Md5::new()),
            ChecksumAlgorithm::Crc32 => Hasher::Crc32(crc32fast::Hasher::new()),
        }
    }

    /// Algorithm of this state
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        match self {
            Hasher::Sha256(_) => ChecksumAlgorithm::Sha256,
            Hasher::Sha512(_) => ChecksumAlgorithm::Sha512,
            Hasher::Md5(_) => ChecksumAlgorithm::Md5,
            Hasher::Crc32(_) => ChecksumAlgorithm::Crc32,
        }
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
            Hasher::Crc32(h) => h.update(data),
        }
    }

    /// Consume the state and produce the digest
    pub fn finalize(self) -> Checksum {
        let algorithm = self.algorithm();
        let bytes = match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Crc32(h) => h.finalize().to_be_bytes().to_vec(),
        };
        Checksum::new(algorithm, bytes)
    }
}

/// Digest everything `reader` yields, up to `limit` bytes when given
///
/// Returns the checksum and the number of bytes hashed.
pub fn digest_reader<R: Read + ?Sized>(
    reader: &mut R,
    algorithm: ChecksumAlgorithm,
    limit: Option<u64>,
) -> Result<(Checksum, u64)> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; 1024 * 1024];
    let mut total = 0u64;

    loop {
        let want = match limit {
            Some(limit) => (limit - total).min(buffer.len() as u64) as usize,
            None => buffer.len(),
        };
        if want == 0 {
            break;
        }

        let n = match reader.read(&mut buffer[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };

        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

// ============================================================================
// Checksum Stage
// ============================================================================

/// Digest published by a [`ChecksumStage`] when its stream ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Digest of every byte that passed through
    pub checksum: Checksum,
    /// Number of bytes covered
    pub length: u64,
}

/// Shared slot a [`ChecksumStage`] writes its result into
#[derive(Debug, Clone, Default)]
pub struct DigestSlot(Arc<Mutex<Option<StreamDigest>>>);

impl DigestSlot {
    /// Empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the published digest, if any
    pub fn take(&self) -> Option<StreamDigest> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn publish(&self, digest: StreamDigest) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(digest);
    }
}

/// Pass-through stage that hashes every byte it forwards
pub struct ChecksumStage {
    hasher: Option<Hasher>,
    length: u64,
    slot: DigestSlot,
}

impl ChecksumStage {
    /// Create a stage and the slot it will publish into
    pub fn new(algorithm: ChecksumAlgorithm) -> (Self, DigestSlot) {
        let slot = DigestSlot::new();
        let stage = Self {
            hasher: Some(Hasher::new(algorithm)),
            length: 0,
            slot: slot.clone(),
        };
        (stage, slot)
    }
}

impl Stage for ChecksumStage {
    fn name(&self) -> &'static str {
        "checksum"
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&block.data);
            self.length += block.len() as u64;
        }
        out.push(block);
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Block>) -> Result<()> {
        if let Some(hasher) = self.hasher.take() {
            let checksum = hasher.finalize();
            tracing::debug!(
                "Source {} over {} bytes: {}",
                checksum.algorithm,
                self.length,
                checksum
            );
            self.slot.publish(StreamDigest {
                checksum,
                length: self.length,
            });
        }
        Ok(())
    }
}
