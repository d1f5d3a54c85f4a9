//! Packed compression-block table entry.
//!
//! Each entry is 12 bytes: a 40-bit physical offset, 24-bit compressed size,
//! 24-bit uncompressed size and an 8-bit index into the method table, all
//! little-endian.

use crate::crypto::align_to_aes_block;

pub const BLOCK_ENTRY_SIZE: usize = 12;

pub const MAX_BLOCK_OFFSET: u64 = (1 << 40) - 1;
pub const MAX_BLOCK_SIZE: u32 = (1 << 24) - 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompressionBlockEntry {
    /// Offset of the stored block in the data file.
    pub offset: u64,
    /// Stored size before AES padding.
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Index into the container's method table; 0 means stored.
    pub method_index: u8,
}

impl CompressionBlockEntry {
    /// Bytes occupied in the data file, including AES padding.
    #[inline]
    pub fn raw_size(&self) -> u64 {
        align_to_aes_block(self.compressed_size as u64)
    }

    /// Whether the fields fit their packed widths.
    pub fn is_encodable(&self) -> bool {
        self.offset <= MAX_BLOCK_OFFSET
            && self.compressed_size <= MAX_BLOCK_SIZE
            && self.uncompressed_size <= MAX_BLOCK_SIZE
    }

    pub fn decode(src: &[u8; BLOCK_ENTRY_SIZE]) -> Self {
        let mut offset = [0u8; 8];
        offset[..5].copy_from_slice(&src[0..5]);
        let compressed_size = u32::from_le_bytes([src[5], src[6], src[7], 0]);
        let uncompressed_size = u32::from_le_bytes([src[8], src[9], src[10], 0]);
        CompressionBlockEntry {
            offset: u64::from_le_bytes(offset),
            compressed_size,
            uncompressed_size,
            method_index: src[11],
        }
    }

    /// Packs the entry. Fields wider than their slot are truncated; callers
    /// check [`is_encodable`](Self::is_encodable) first.
    pub fn encode(&self) -> [u8; BLOCK_ENTRY_SIZE] {
        let mut out = [0u8; BLOCK_ENTRY_SIZE];
        out[0..5].copy_from_slice(&self.offset.to_le_bytes()[..5]);
        out[5..8].copy_from_slice(&self.compressed_size.to_le_bytes()[..3]);
        out[8..11].copy_from_slice(&self.uncompressed_size.to_le_bytes()[..3]);
        out[11] = self.method_index;
        out
    }
}
