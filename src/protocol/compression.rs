//! OP_COMPRESSED support.
//!
//! Compressors are identified on the wire by a one-byte id and negotiated by name
//! during the handshake: noop (0), snappy (1), zlib (2) and zstd (3). Other
//! algorithms can be registered by implementing [`Compressor`].

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::error::FrameError;

pub trait Compressor: Send + Sync + fmt::Debug {
    /// Wire id written into OP_COMPRESSED frames.
    fn id(&self) -> u8;

    /// Name advertised in the handshake `compression` list.
    fn name(&self) -> &str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError>;

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, FrameError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &str {
        "noop"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], _uncompressed_size: usize) -> Result<Vec<u8>, FrameError> {
        Ok(data.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &str {
        "snappy"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| FrameError::Compression(format!("snappy: {e}")))
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, FrameError> {
        let declared = snap::raw::decompress_len(data)
            .map_err(|e| FrameError::Compression(format!("snappy: {e}")))?;
        if declared != uncompressed_size {
            return Err(FrameError::LengthMismatch {
                declared: uncompressed_size,
                actual: declared,
            });
        }
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| FrameError::Compression(format!("snappy: {e}")))
    }
}

/// zlib at a configurable level (0-9).
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: u32,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new(6)
    }
}

impl Compressor for ZlibCompressor {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(self.level),
        );
        encoder
            .write_all(data)
            .map_err(|e| FrameError::Compression(format!("zlib: {e}")))?;
        encoder
            .finish()
            .map_err(|e| FrameError::Compression(format!("zlib: {e}")))
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, FrameError> {
        // One byte past the declared size is enough to detect a lying prefix.
        let mut out = Vec::with_capacity(uncompressed_size);
        ZlibDecoder::new(data)
            .take(uncompressed_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| FrameError::Compression(format!("zlib: {e}")))?;
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl Compressor for ZstdCompressor {
    fn id(&self) -> u8 {
        3
    }

    fn name(&self) -> &str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        zstd::bulk::compress(data, self.level)
            .map_err(|e| FrameError::Compression(format!("zstd: {e}")))
    }

    fn decompress(&self, data: &[u8], uncompressed_size: usize) -> Result<Vec<u8>, FrameError> {
        zstd::bulk::decompress(data, uncompressed_size)
            .map_err(|e| FrameError::Compression(format!("zstd: {e}")))
    }
}

/// Compressors available for decoding and negotiation.
#[derive(Debug, Clone)]
pub struct CompressorRegistry {
    compressors: Vec<Arc<dyn Compressor>>,
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self {
            compressors: vec![
                Arc::new(SnappyCompressor),
                Arc::new(ZstdCompressor::default()),
                Arc::new(ZlibCompressor::default()),
                Arc::new(NoopCompressor),
            ],
        }
    }
}

impl CompressorRegistry {
    pub fn empty() -> Self {
        Self {
            compressors: Vec::new(),
        }
    }

    /// Register a compressor, replacing any with the same id.
    pub fn register(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressors.retain(|c| c.id() != compressor.id());
        self.compressors.push(compressor);
    }

    pub fn by_id(&self, id: u8) -> Option<Arc<dyn Compressor>> {
        self.compressors.iter().find(|c| c.id() == id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn Compressor>> {
        self.compressors.iter().find(|c| c.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.compressors.iter().map(|c| c.name().to_string()).collect()
    }

    /// First compressor in the server's preference order that we also support.
    pub fn pick(&self, server_supported: &[String]) -> Option<Arc<dyn Compressor>> {
        server_supported.iter().find_map(|name| self.by_name(name))
    }
}
