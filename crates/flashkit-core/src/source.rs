//! Image sources
//!
//! A [`FlashSource`] bundles the byte stream to flash with its declared sizes,
//! an optional transform stage (decompression for compressed images) and an
//! optional [`BlockMap`] for sparse writes.

use crate::error::{Error, Result};
use crate::sparse::BlockMap;
use crate::stage::Stage;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

#[cfg(feature = "compression")]
use crate::block::Block;

// ============================================================================
// Compression Detection
// ============================================================================

/// Compression wrapping a source image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Raw image
    None,
    /// Gzip (.gz)
    Gzip,
    /// XZ (.xz)
    Xz,
    /// Zstandard (.zst)
    Zstd,
    /// Bzip2 (.bz2)
    Bzip2,
}

impl Compression {
    /// Whether the source needs a decompression stage
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Compression::None)
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
            Compression::Bzip2 => "bzip2",
        }
    }

    /// Detect compression from a file name
    pub fn from_extension(path: &str) -> Self {
        let lower = path.to_lowercase();
        if lower.ends_with(".gz") || lower.ends_with(".gzip") {
            Compression::Gzip
        } else if lower.ends_with(".xz") {
            Compression::Xz
        } else if lower.ends_with(".zst") || lower.ends_with(".zstd") {
            Compression::Zstd
        } else if lower.ends_with(".bz2") || lower.ends_with(".bzip2") {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    /// Detect compression from the first bytes of a stream
    pub fn from_magic(bytes: &[u8]) -> Self {
        match bytes {
            [0x1f, 0x8b, ..] => Compression::Gzip,
            [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, ..] => Compression::Xz,
            [0x28, 0xb5, 0x2f, 0xfd, ..] => Compression::Zstd,
            [0x42, 0x5a, 0x68, ..] => Compression::Bzip2,
            _ => Compression::None,
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Source
// ============================================================================

/// Declared sizes of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSize {
    /// Bytes the reader yields
    pub original: u64,
    /// Bytes that will reach the target after the transform
    pub final_size: u64,
    /// Whether `final_size` is a guess
    ///
    /// An estimated `final_size` is only shown to the user. Write progress
    /// for such a source is metered on the raw bytes read, against
    /// `original`, since the estimate can be wrong (a gzip trailer only
    /// holds the size modulo 4 GiB, other formats give no size at all).
    pub estimated: bool,
}

impl SourceSize {
    /// Source whose output size is known up front
    pub fn exact(size: u64) -> Self {
        Self {
            original: size,
            final_size: size,
            estimated: false,
        }
    }

    /// Source whose output size is only estimated
    pub fn estimated(original: u64, final_size: u64) -> Self {
        Self {
            original,
            final_size,
            estimated: true,
        }
    }
}

/// Everything a flash run needs to know about its input
pub struct FlashSource {
    /// Byte stream to flash
    pub reader: Box<dyn Read + Send>,
    /// Declared sizes
    pub size: SourceSize,
    /// Stage applied before blocking (decompression, for instance)
    pub transform: Option<Box<dyn Stage>>,
    /// Occupied ranges for sparse writes
    pub block_map: Option<Arc<BlockMap>>,
    /// Compression detected when the source was opened
    pub compression: Compression,
}

impl FlashSource {
    /// Wrap a reader that yields exactly `size` bytes
    pub fn from_reader<R>(reader: R, size: u64) -> Self
    where
        R: Read + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            size: SourceSize::exact(size),
            transform: None,
            block_map: None,
            compression: Compression::None,
        }
    }

    /// Open a local image, adding a decompression stage when needed
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        let mut file = File::open(path)
            .map_err(|e| Error::upstream("source", format!("{}: {}", shown, e)))?;
        let file_size = file.metadata()?.len();

        let mut compression = Compression::from_extension(&shown);
        let isize_hint = if compression == Compression::Gzip || compression == Compression::None {
            gzip_isize(&mut file, file_size)?
        } else {
            None
        };

        let mut reader = BufReader::new(file);
        if compression == Compression::None {
            compression = Compression::from_magic(reader.fill_buf()?);
        }

        tracing::debug!(
            "Opened source {} ({} bytes, compression: {})",
            shown,
            file_size,
            compression
        );

        let source = Self {
            reader: Box::new(reader),
            size: SourceSize::exact(file_size),
            transform: None,
            block_map: None,
            compression,
        };

        if !compression.is_compressed() {
            return Ok(source);
        }

        let estimate = match compression {
            Compression::Gzip => isize_hint.unwrap_or(file_size),
            _ => file_size,
        };
        source.decompressed(estimate)
    }

    #[cfg(feature = "compression")]
    fn decompressed(self, estimate: u64) -> Result<Self> {
        let stage = Decompress::new(self.compression)?;
        let original = self.size.original;
        Ok(self
            .with_transform(Box::new(stage))
            .with_size(SourceSize::estimated(original, estimate)))
    }

    #[cfg(not(feature = "compression"))]
    fn decompressed(self, _estimate: u64) -> Result<Self> {
        Err(Error::InvalidConfig(format!(
            "{} source needs the 'compression' feature",
            self.compression
        )))
    }

    /// Attach a transform stage
    pub fn with_transform(mut self, stage: Box<dyn Stage>) -> Self {
        self.transform = Some(stage);
        self
    }

    /// Attach a block map for sparse writes
    pub fn with_block_map(mut self, map: Arc<BlockMap>) -> Self {
        self.block_map = Some(map);
        self
    }

    /// Override the declared sizes
    pub fn with_size(mut self, size: SourceSize) -> Self {
        self.size = size;
        self
    }
}

impl std::fmt::Debug for FlashSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashSource")
            .field("size", &self.size)
            .field("transform", &self.transform.as_ref().map(|s| s.name()))
            .field("block_map", &self.block_map.is_some())
            .field("compression", &self.compression)
            .finish()
    }
}

/// Uncompressed size recorded in a gzip trailer (modulo 4 GiB)
fn gzip_isize(file: &mut File, file_size: u64) -> Result<Option<u64>> {
    if file_size < 18 {
        return Ok(None);
    }

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic)?;
    if magic != [0x1f, 0x8b] {
        file.seek(SeekFrom::Start(0))?;
        return Ok(None);
    }

    let mut trailer = [0u8; 4];
    file.seek(SeekFrom::End(-4))?;
    file.read_exact(&mut trailer)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(Some(u32::from_le_bytes(trailer) as u64))
}

// ============================================================================
// Decompression Stage
// ============================================================================

/// Largest block [`Decompress`] emits (64 KB)
#[cfg(feature = "compression")]
pub const MAX_DECODED_BLOCK: usize = 64 * 1024;

/// Upper bound on a gzip member header (extra field plus name and comment)
#[cfg(feature = "compression")]
const MAX_GZIP_HEADER: usize = 128 * 1024;

/// Progress made by one codec call
#[cfg(feature = "compression")]
struct Step {
    consumed: usize,
    produced: usize,
    /// The input consumed so far ends a complete stream (or frame)
    ended: bool,
}

#[cfg(feature = "compression")]
enum Codec {
    Gzip(GzipMember),
    Xz(xz2::stream::Stream),
    Zstd(zstd::stream::raw::Decoder<'static>),
    Bzip2(bzip2::Decompress),
}

#[cfg(feature = "compression")]
impl Codec {
    fn new(compression: Compression) -> Result<Self> {
        Ok(match compression {
            Compression::Gzip => Codec::Gzip(GzipMember::new()),
            Compression::Xz => Codec::Xz(
                xz2::stream::Stream::new_stream_decoder(u64::MAX, 0)
                    .map_err(|e| Error::upstream("decompress", e))?,
            ),
            Compression::Zstd => Codec::Zstd(
                zstd::stream::raw::Decoder::new().map_err(|e| Error::upstream("decompress", e))?,
            ),
            Compression::Bzip2 => Codec::Bzip2(bzip2::Decompress::new(false)),
            Compression::None => {
                return Err(Error::InvalidConfig(
                    "No decompression needed for an uncompressed source".to_string(),
                ))
            }
        })
    }

    /// Decode from `input` into `output`, stopping when either runs out
    fn step(&mut self, input: &[u8], output: &mut [u8]) -> Result<Step> {
        match self {
            Codec::Gzip(member) => member.step(input, output),
            Codec::Xz(stream) => {
                let (before_in, before_out) = (stream.total_in(), stream.total_out());
                let status = stream
                    .process(input, output, xz2::stream::Action::Run)
                    .map_err(|e| Error::upstream("decompress", format!("corrupt xz stream: {}", e)))?;
                Ok(Step {
                    consumed: (stream.total_in() - before_in) as usize,
                    produced: (stream.total_out() - before_out) as usize,
                    ended: matches!(status, xz2::stream::Status::StreamEnd),
                })
            }
            Codec::Zstd(decoder) => {
                use zstd::stream::raw::{InBuffer, Operation, OutBuffer};

                let mut src = InBuffer::around(input);
                let mut dst = OutBuffer::around(output);
                // A zero hint means the frame is complete and fully flushed
                let hint = decoder.run(&mut src, &mut dst).map_err(|e| {
                    Error::upstream("decompress", format!("corrupt zstd stream: {}", e))
                })?;
                Ok(Step {
                    consumed: src.pos(),
                    produced: dst.pos(),
                    ended: hint == 0,
                })
            }
            Codec::Bzip2(stream) => {
                let (before_in, before_out) = (stream.total_in(), stream.total_out());
                let status = stream.decompress(input, output).map_err(|e| {
                    Error::upstream("decompress", format!("corrupt bzip2 stream: {}", e))
                })?;
                Ok(Step {
                    consumed: (stream.total_in() - before_in) as usize,
                    produced: (stream.total_out() - before_out) as usize,
                    ended: matches!(status, bzip2::Status::StreamEnd),
                })
            }
        }
    }
}

#[cfg(feature = "compression")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GzipPhase {
    Header,
    Body,
    Trailer,
    Done,
}

/// One gzip member: header, raw deflate body, CRC32 and ISIZE trailer
#[cfg(feature = "compression")]
struct GzipMember {
    phase: GzipPhase,
    header: Vec<u8>,
    inflate: flate2::Decompress,
    crc: crc32fast::Hasher,
    size: u32,
    trailer: Vec<u8>,
}

#[cfg(feature = "compression")]
impl GzipMember {
    fn new() -> Self {
        Self {
            phase: GzipPhase::Header,
            header: Vec::new(),
            inflate: flate2::Decompress::new(false),
            crc: crc32fast::Hasher::new(),
            size: 0,
            trailer: Vec::with_capacity(8),
        }
    }

    fn step(&mut self, input: &[u8], output: &mut [u8]) -> Result<Step> {
        let mut consumed = 0;
        loop {
            let rest = &input[consumed..];
            match self.phase {
                GzipPhase::Header => {
                    let before = self.header.len();
                    self.header.extend_from_slice(rest);
                    match gzip_header_len(&self.header)? {
                        Some(len) => {
                            consumed += len - before;
                            self.header.clear();
                            self.phase = GzipPhase::Body;
                        }
                        None if self.header.len() > MAX_GZIP_HEADER => {
                            return Err(Error::upstream("decompress", "gzip header too long"));
                        }
                        None => {
                            return Ok(Step {
                                consumed: input.len(),
                                produced: 0,
                                ended: false,
                            });
                        }
                    }
                }
                GzipPhase::Body => {
                    let (before_in, before_out) =
                        (self.inflate.total_in(), self.inflate.total_out());
                    let status = self
                        .inflate
                        .decompress(rest, output, flate2::FlushDecompress::None)
                        .map_err(|e| {
                            Error::upstream("decompress", format!("corrupt gzip stream: {}", e))
                        })?;
                    consumed += (self.inflate.total_in() - before_in) as usize;
                    let produced = (self.inflate.total_out() - before_out) as usize;

                    self.crc.update(&output[..produced]);
                    self.size = self.size.wrapping_add(produced as u32);

                    if matches!(status, flate2::Status::StreamEnd) {
                        self.phase = GzipPhase::Trailer;
                        if produced == 0 {
                            continue;
                        }
                    }
                    return Ok(Step {
                        consumed,
                        produced,
                        ended: false,
                    });
                }
                GzipPhase::Trailer => {
                    let take = (8 - self.trailer.len()).min(rest.len());
                    self.trailer.extend_from_slice(&rest[..take]);
                    consumed += take;
                    if self.trailer.len() < 8 {
                        return Ok(Step {
                            consumed,
                            produced: 0,
                            ended: false,
                        });
                    }

                    let crc = u32::from_le_bytes([
                        self.trailer[0],
                        self.trailer[1],
                        self.trailer[2],
                        self.trailer[3],
                    ]);
                    let size = u32::from_le_bytes([
                        self.trailer[4],
                        self.trailer[5],
                        self.trailer[6],
                        self.trailer[7],
                    ]);
                    let actual = std::mem::take(&mut self.crc).finalize();
                    if crc != actual || size != self.size {
                        return Err(Error::upstream(
                            "decompress",
                            format!(
                                "corrupt gzip stream: trailer expects crc {:08x} and {} bytes, got crc {:08x} and {} bytes",
                                crc, size, actual, self.size
                            ),
                        ));
                    }
                    self.phase = GzipPhase::Done;
                }
                GzipPhase::Done => {
                    return Ok(Step {
                        consumed,
                        produced: 0,
                        ended: true,
                    });
                }
            }
        }
    }
}

/// Length of the gzip member header at the start of `buf`, `None` while
/// more bytes are needed
#[cfg(feature = "compression")]
fn gzip_header_len(buf: &[u8]) -> Result<Option<usize>> {
    const FHCRC: u8 = 0x02;
    const FEXTRA: u8 = 0x04;
    const FNAME: u8 = 0x08;
    const FCOMMENT: u8 = 0x10;

    if buf.len() >= 2 && buf[..2] != [0x1f, 0x8b] {
        return Err(Error::upstream("decompress", "corrupt gzip stream: bad magic"));
    }
    if buf.len() >= 3 && buf[2] != 8 {
        return Err(Error::upstream(
            "decompress",
            format!("unsupported gzip compression method {}", buf[2]),
        ));
    }
    if buf.len() < 10 {
        return Ok(None);
    }

    let flags = buf[3];
    if flags & 0xe0 != 0 {
        return Err(Error::upstream(
            "decompress",
            "corrupt gzip stream: reserved header flags set",
        ));
    }

    let mut pos = 10;
    if flags & FEXTRA != 0 {
        let Some(xlen) = buf.get(pos..pos + 2) else {
            return Ok(None);
        };
        pos += 2 + u16::from_le_bytes([xlen[0], xlen[1]]) as usize;
        if buf.len() < pos {
            return Ok(None);
        }
    }
    for flag in [FNAME, FCOMMENT] {
        if flags & flag != 0 {
            match buf[pos..].iter().position(|&b| b == 0) {
                Some(end) => pos += end + 1,
                None => return Ok(None),
            }
        }
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }

    Ok((buf.len() >= pos).then_some(pos))
}

/// Push-driven decompression stage
///
/// Consumed chunks are queued and decoded into a fixed buffer, one block of
/// at most [`MAX_DECODED_BLOCK`] bytes per call, so a highly compressible
/// image never expands in memory. Concatenated streams are decoded one after
/// another. Ending in the middle of a stream is an error.
#[cfg(feature = "compression")]
pub struct Decompress {
    compression: Compression,
    codec: Option<Codec>,
    pending: Vec<u8>,
    offset: usize,
    output: Vec<u8>,
    ended: bool,
    // The last call filled the output buffer, the codec may hold more
    draining: bool,
}

#[cfg(feature = "compression")]
impl Decompress {
    /// Create a decoder for `compression`
    pub fn new(compression: Compression) -> Result<Self> {
        Ok(Self {
            compression,
            codec: Some(Codec::new(compression)?),
            pending: Vec::new(),
            offset: 0,
            output: vec![0u8; MAX_DECODED_BLOCK],
            ended: false,
            draining: false,
        })
    }

    fn has_work(&self) -> bool {
        self.offset < self.pending.len() || self.draining
    }

    /// Decode until one block is produced or the queued input runs out
    fn decode_one(&mut self, out: &mut Vec<Block>) -> Result<()> {
        let Some(codec) = self.codec.as_mut() else {
            return Err(Error::upstream("decompress", "data after end of stream"));
        };

        loop {
            let input = &self.pending[self.offset..];
            if self.ended {
                if input.is_empty() {
                    self.draining = false;
                    return Ok(());
                }
                // Next stream of a concatenated file
                *codec = Codec::new(self.compression)?;
                self.ended = false;
            }

            let step = codec.step(input, &mut self.output)?;
            self.offset += step.consumed;
            self.ended = step.ended;
            self.draining = step.produced == self.output.len();

            if self.offset == self.pending.len() {
                self.pending.clear();
                self.offset = 0;
            }

            if step.produced > 0 {
                out.push(Block::raw(self.output[..step.produced].to_vec()));
                return Ok(());
            }
            if self.pending.is_empty() {
                return Ok(());
            }
            if step.consumed == 0 && !step.ended {
                return Err(Error::upstream(
                    "decompress",
                    format!("{} decoder stopped making progress", self.compression),
                ));
            }
        }
    }
}

#[cfg(feature = "compression")]
impl Stage for Decompress {
    fn name(&self) -> &'static str {
        "decompress"
    }

    fn consume(&mut self, block: Block, out: &mut Vec<Block>) -> Result<()> {
        if self.codec.is_none() {
            return Err(Error::upstream("decompress", "data after end of stream"));
        }
        if self.pending.is_empty() {
            self.pending = block.data;
        } else {
            self.pending.extend_from_slice(&block.data);
        }
        self.decode_one(out)
    }

    fn resume(&mut self, out: &mut Vec<Block>) -> Result<bool> {
        if self.codec.is_none() || !self.has_work() {
            return Ok(false);
        }
        self.decode_one(out)?;
        Ok(true)
    }

    fn flush(&mut self, out: &mut Vec<Block>) -> Result<()> {
        if self.codec.is_none() {
            return Ok(());
        }
        while self.has_work() {
            self.decode_one(out)?;
        }
        self.codec = None;

        if !self.ended {
            return Err(Error::upstream(
                "decompress",
                format!("truncated {} stream", self.compression),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;

    // -------------------------------------------------------------------------
    // Detection
    // -------------------------------------------------------------------------

    #[test]
    fn test_compression_from_extension() {
        assert_eq!(Compression::from_extension("disk.img"), Compression::None);
        assert_eq!(Compression::from_extension("disk.img.gz"), Compression::Gzip);
        assert_eq!(Compression::from_extension("DISK.IMG.XZ"), Compression::Xz);
        assert_eq!(Compression::from_extension("disk.zst"), Compression::Zstd);
        assert_eq!(Compression::from_extension("disk.img.bz2"), Compression::Bzip2);
    }

    #[test]
    fn test_compression_from_magic() {
        assert_eq!(
            Compression::from_magic(&[0x1f, 0x8b, 0x08]),
            Compression::Gzip
        );
        assert_eq!(
            Compression::from_magic(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            Compression::Xz
        );
        assert_eq!(
            Compression::from_magic(&[0x28, 0xb5, 0x2f, 0xfd]),
            Compression::Zstd
        );
        assert_eq!(Compression::from_magic(b"BZh9"), Compression::Bzip2);
        assert_eq!(Compression::from_magic(&[0x1f]), Compression::None);
        assert_eq!(Compression::from_magic(&[]), Compression::None);
    }

    // -------------------------------------------------------------------------
    // Opening
    // -------------------------------------------------------------------------

    #[test]
    fn test_from_reader_is_exact() {
        let source = FlashSource::from_reader(Cursor::new(vec![0u8; 10]), 10);
        assert_eq!(source.size, SourceSize::exact(10));
        assert!(source.transform.is_none());
        assert!(source.block_map.is_none());
    }

    #[test]
    fn test_open_plain_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain.img");
        std::fs::write(&path, vec![0xAB; 5000]).unwrap();

        let mut source = FlashSource::open(&path).unwrap();
        assert_eq!(source.compression, Compression::None);
        assert_eq!(source.size, SourceSize::exact(5000));
        assert!(source.transform.is_none());

        let mut data = Vec::new();
        source.reader.read_to_end(&mut data).unwrap();
        assert_eq!(data.len(), 5000);
    }

    #[test]
    fn test_open_missing_file() {
        let result = FlashSource::open("/nonexistent/flashkit.img");
        assert!(matches!(result, Err(Error::Upstream { stage: "source", .. })));
    }

    #[cfg(feature = "compression")]
    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_open_gzip_by_magic_uses_trailer_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("image.bin");
        std::fs::write(&path, gzip(&[7u8; 20_000])).unwrap();

        let source = FlashSource::open(&path).unwrap();
        assert_eq!(source.compression, Compression::Gzip);
        assert!(source.size.estimated);
        assert_eq!(source.size.final_size, 20_000);
        assert_eq!(
            source.transform.as_ref().map(|s| s.name()),
            Some("decompress")
        );
    }

    // -------------------------------------------------------------------------
    // Decompress stage
    // -------------------------------------------------------------------------

    #[cfg(feature = "compression")]
    const CODECS: [Compression; 4] = [
        Compression::Gzip,
        Compression::Xz,
        Compression::Zstd,
        Compression::Bzip2,
    ];

    #[cfg(feature = "compression")]
    fn compress(compression: Compression, data: &[u8]) -> Vec<u8> {
        match compression {
            Compression::Gzip => gzip(data),
            Compression::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            }
            Compression::Zstd => zstd::encode_all(Cursor::new(data), 3).unwrap(),
            Compression::Bzip2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder.write_all(data).unwrap();
                encoder.finish().unwrap()
            }
            Compression::None => data.to_vec(),
        }
    }

    /// Drive the stage the way a pipeline does
    #[cfg(feature = "compression")]
    fn run_stage(stage: &mut Decompress, input: &[u8], chunk: usize) -> Result<Vec<Block>> {
        let mut out = Vec::new();
        for piece in input.chunks(chunk) {
            stage.consume(Block::raw(piece.to_vec()), &mut out)?;
            while stage.resume(&mut out)? {}
        }
        stage.flush(&mut out)?;
        Ok(out)
    }

    #[cfg(feature = "compression")]
    fn decode(compression: Compression, input: &[u8], chunk: usize) -> Result<Vec<u8>> {
        let mut stage = Decompress::new(compression).unwrap();
        let blocks = run_stage(&mut stage, input, chunk)?;
        Ok(blocks.into_iter().flat_map(|b| b.data).collect())
    }

    #[cfg(feature = "compression")]
    fn sample(len: usize) -> Vec<u8> {
        (0..len as u32).map(|i| (i % 97) as u8).collect()
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_every_codec_in_small_chunks() {
        let plain = sample(200_000);
        for compression in CODECS {
            let compressed = compress(compression, &plain);
            assert_eq!(
                decode(compression, &compressed, 333).unwrap(),
                plain,
                "{}",
                compression
            );
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_emits_bounded_blocks() {
        let zeros = vec![0u8; 8 * 1024 * 1024];
        for compression in CODECS {
            let compressed = compress(compression, &zeros);
            let mut stage = Decompress::new(compression).unwrap();

            // The whole image fits in one read, yet only one block comes out
            let mut out = Vec::new();
            stage.consume(Block::raw(compressed), &mut out).unwrap();
            assert!(out.len() <= 1, "{}", compression);

            while stage.resume(&mut out).unwrap() {}
            stage.flush(&mut out).unwrap();

            let largest = out.iter().map(Block::len).max().unwrap_or(0);
            assert!(largest <= MAX_DECODED_BLOCK, "{}: {}", compression, largest);
            assert_eq!(
                out.iter().map(Block::len).sum::<usize>(),
                zeros.len(),
                "{}",
                compression
            );
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_truncated_stream_is_upstream_error() {
        let plain = sample(200_000);
        for compression in CODECS {
            let compressed = compress(compression, &plain);
            for cut in [compressed.len() / 2, compressed.len() - 1] {
                let result = decode(compression, &compressed[..cut], 4096);
                assert!(
                    matches!(
                        result,
                        Err(Error::Upstream {
                            stage: "decompress",
                            ..
                        })
                    ),
                    "{} cut at {}",
                    compression,
                    cut
                );
            }
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_empty_input_is_truncated() {
        for compression in CODECS {
            let mut stage = Decompress::new(compression).unwrap();
            let result = stage.flush(&mut Vec::new());
            assert!(
                matches!(result, Err(Error::Upstream { ref message, .. }) if message.contains("truncated")),
                "{}",
                compression
            );
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_concatenated_streams() {
        let (first, second) = (sample(10_000), vec![5u8; 7000]);
        for compression in CODECS {
            let mut input = compress(compression, &first);
            input.extend(compress(compression, &second));

            let decoded = decode(compression, &input, 1000).unwrap();
            assert_eq!(decoded.len(), 17_000, "{}", compression);
            assert_eq!(&decoded[..10_000], &first[..]);
            assert_eq!(&decoded[10_000..], &second[..]);
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_gzip_header_fields_split_across_chunks() {
        let plain = sample(30_000);
        let mut encoder = flate2::GzBuilder::new()
            .filename("disk.img")
            .comment("nightly build")
            .extra(vec![1, 2, 3, 4])
            .write(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decode(Compression::Gzip, &compressed, 1).unwrap(), plain);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_gzip_trailer_mismatch() {
        let mut compressed = gzip(&sample(5000));
        let crc_at = compressed.len() - 8;
        compressed[crc_at] ^= 0xff;

        let result = decode(Compression::Gzip, &compressed, 4096);
        assert!(matches!(
            result,
            Err(Error::Upstream { ref message, .. }) if message.contains("trailer")
        ));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_gzip_header_len() {
        assert_eq!(gzip_header_len(&[0x1f, 0x8b, 8]).unwrap(), None);
        assert_eq!(
            gzip_header_len(&[0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 3]).unwrap(),
            Some(10)
        );
        // FNAME without its terminator yet
        assert_eq!(
            gzip_header_len(&[0x1f, 0x8b, 8, 0x08, 0, 0, 0, 0, 0, 3, b'a']).unwrap(),
            None
        );
        assert_eq!(
            gzip_header_len(&[0x1f, 0x8b, 8, 0x08, 0, 0, 0, 0, 0, 3, b'a', 0]).unwrap(),
            Some(12)
        );
        assert!(gzip_header_len(&[0x1f, 0x8c]).is_err());
        assert!(gzip_header_len(&[0x1f, 0x8b, 9]).is_err());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_corrupt_stream_is_upstream_error() {
        for compression in CODECS {
            let result = decode(compression, b"definitely not compressed data", 8);
            assert!(
                matches!(
                    result,
                    Err(Error::Upstream {
                        stage: "decompress",
                        ..
                    })
                ),
                "{}",
                compression
            );
        }
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_rejects_data_after_flush() {
        let mut stage = Decompress::new(Compression::Zstd).unwrap();
        run_stage(&mut stage, &compress(Compression::Zstd, b"abc"), 64).unwrap();
        assert!(stage
            .consume(Block::raw(vec![1]), &mut Vec::new())
            .is_err());
    }

    #[cfg(feature = "compression")]
    #[test]
    fn test_decompress_none_rejected() {
        assert!(Decompress::new(Compression::None).is_err());
    }
}
