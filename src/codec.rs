//! Compression methods a container block may be stored with.

use std::fmt;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{IoStoreError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CompressionMethod {
    /// Stored verbatim.
    #[default]
    None,
    /// LZ4 block format without a size prefix.
    Lz4,
    /// zlib stream (RFC 1950).
    Zlib,
}

impl CompressionMethod {
    pub const ALL: [CompressionMethod; 3] =
        [CompressionMethod::None, CompressionMethod::Lz4, CompressionMethod::Zlib];

    /// Name as recorded in a TOC method table.
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::None => "None",
            CompressionMethod::Lz4 => "LZ4",
            CompressionMethod::Zlib => "Zlib",
        }
    }

    /// Case-insensitive lookup of a TOC method name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.name().eq_ignore_ascii_case(name))
    }

    pub fn is_none(self) -> bool {
        self == CompressionMethod::None
    }

    /// Compresses `src`. `None` returns a copy.
    pub fn compress(self, src: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::None => Ok(src.to_vec()),
            CompressionMethod::Lz4 => Ok(lz4_flex::block::compress(src)),
            CompressionMethod::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(src.len() / 2), Compression::default());
                encoder
                    .write_all(src)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| IoStoreError::InvalidParameter(format!("zlib compression failed: {}", e)))
            }
        }
    }

    /// Decompresses `src` into exactly `dst.len()` bytes.
    pub fn decompress(self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        match self {
            CompressionMethod::None => {
                if src.len() < dst.len() {
                    return Err(IoStoreError::DecompressionFailed(format!(
                        "stored block holds {} bytes, expected {}",
                        src.len(),
                        dst.len()
                    )));
                }
                dst.copy_from_slice(&src[..dst.len()]);
                Ok(())
            }
            CompressionMethod::Lz4 => {
                let written = lz4_flex::block::decompress_into(src, dst)
                    .map_err(|e| IoStoreError::DecompressionFailed(format!("LZ4: {}", e)))?;
                if written != dst.len() {
                    return Err(IoStoreError::DecompressionFailed(format!(
                        "LZ4: produced {} bytes, expected {}",
                        written,
                        dst.len()
                    )));
                }
                Ok(())
            }
            CompressionMethod::Zlib => ZlibDecoder::new(src)
                .read_exact(dst)
                .map_err(|e| IoStoreError::DecompressionFailed(format!("Zlib: {}", e))),
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
