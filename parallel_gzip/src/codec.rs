//! Chunk transforms: gzip compression and decompression.
//!
//! Compressed chunks are gzip members with the constant 10-byte header
//! removed. The header is put back before decoding. The gzip trailer stays,
//! so the last four bytes of a compressed chunk hold the uncompressed size
//! (ISIZE, little-endian).

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::block::InputChunk;
use crate::error::{Error, Result};

/// Length of a gzip header without optional fields.
pub const GZIP_HEADER_LEN: usize = 10;

/// Header re-synthesized in front of every compressed chunk before decoding.
const GZIP_HEADER: [u8; GZIP_HEADER_LEN] = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xff];

/// Length of the ISIZE field closing a gzip member.
pub const ISIZE_LEN: usize = 4;

const MAX_DEFLATE_RATIO: usize = 1032;

/// Turns one input chunk's payload into its output payload.
///
/// Implementations are shared by every transformer thread.
pub trait Transform: Sync {
    fn transform(&self, chunk: &InputChunk) -> Result<Vec<u8>>;

    /// Description attached to transform failures.
    fn failure_context(&self) -> &'static str {
        "failed to transform block"
    }
}

impl<F> Transform for F
where
    F: Fn(&InputChunk) -> Result<Vec<u8>> + Sync,
{
    fn transform(&self, chunk: &InputChunk) -> Result<Vec<u8>> {
        self(chunk)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GzipCompress {
    level: Compression,
}

impl GzipCompress {
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), self.level);
        encoder
            .write_all(data)
            .map_err(|e| Error::io("failed to compress block", e))?;
        let mut member = encoder
            .finish()
            .map_err(|e| Error::io("failed to compress block", e))?;

        if member.len() < GZIP_HEADER_LEN {
            return Err(Error::InvalidState(
                "compressed block is shorter than the gzip header",
            ));
        }
        member.drain(..GZIP_HEADER_LEN);
        Ok(member)
    }
}

impl Default for GzipCompress {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl Transform for GzipCompress {
    fn transform(&self, chunk: &InputChunk) -> Result<Vec<u8>> {
        self.compress(chunk.data())
    }

    fn failure_context(&self) -> &'static str {
        "failed to compress input file block"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecompress;

impl GzipDecompress {
    /// Reads the uncompressed size from the trailer of a compressed chunk.
    pub fn original_len(payload: &[u8]) -> Result<u64> {
        let start = payload.len().checked_sub(ISIZE_LEN).ok_or_else(|| {
            Error::InvalidArchive(format!(
                "block of {} bytes is too short to hold its size trailer",
                payload.len()
            ))
        })?;
        let mut isize_bytes = [0u8; ISIZE_LEN];
        isize_bytes.copy_from_slice(&payload[start..]);
        let declared = i32::from_le_bytes(isize_bytes);
        u64::try_from(declared)
            .map_err(|_| Error::InvalidArchive(format!("negative original block size {}", declared)))
    }

    pub fn decompress(&self, payload: &[u8], expected_len: u64) -> Result<Vec<u8>> {
        // Deflate cannot expand beyond ~1032:1, so a forged ISIZE can't
        // force a huge allocation.
        let capacity = usize::try_from(Self::original_len(payload)?)
            .unwrap_or(0)
            .min(payload.len().saturating_mul(MAX_DEFLATE_RATIO));
        let mut out = Vec::with_capacity(capacity);
        let mut decoder = GzDecoder::new((&GZIP_HEADER[..]).chain(payload));
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::io("failed to decompress block", e))?;

        let actual = out.len() as u64;
        if actual != expected_len {
            return Err(Error::SizeMismatch {
                expected: expected_len,
                actual,
            });
        }
        Ok(out)
    }
}

impl Transform for GzipDecompress {
    fn transform(&self, chunk: &InputChunk) -> Result<Vec<u8>> {
        self.decompress(chunk.data(), chunk.original_len())
    }

    fn failure_context(&self) -> &'static str {
        "failed to decompress archive block"
    }
}
