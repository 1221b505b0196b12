//! Compact on-disk representation of DCC documents.
use std::{
    fmt::Debug,
    io::{Read, Write},
};

use bzip2::{Compression, read::BzDecoder, write::BzEncoder};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Byte-level codec used for compressed DCC documents.
pub trait Codec: Debug + Send + Sync {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError>;
    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// bzip2 at the highest compression level.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bzip2Codec;

impl Codec for Bzip2Codec {
    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(raw).map_err(CodecError::Compress)?;
        encoder.finish().map_err(CodecError::Compress)
    }

    fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut raw = Vec::new();
        BzDecoder::new(compressed)
            .read_to_end(&mut raw)
            .map_err(CodecError::Decompress)?;
        Ok(raw)
    }
}

/// Compressed document plus its summary metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompressedDcc {
    data: Vec<u8>,
    crc32: u32,
    bytes_compressed: usize,
    bytes_uncompressed: usize,
}

impl CompressedDcc {
    pub fn new(raw: &[u8], codec: &dyn Codec) -> Result<Self, CodecError> {
        let data = codec.compress(raw)?;
        Ok(Self {
            crc32: crc32fast::hash(&data),
            bytes_compressed: data.len(),
            bytes_uncompressed: raw.len(),
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// CRC-32 of the compressed bytes.
    pub fn crc32(&self) -> u32 {
        self.crc32
    }

    pub fn bytes_compressed(&self) -> usize {
        self.bytes_compressed
    }

    pub fn bytes_uncompressed(&self) -> usize {
        self.bytes_uncompressed
    }
}
